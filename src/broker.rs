//! Broker 客户端模块 - RabbitMQ 连接生命周期
//!
//! 连接断开后按固定间隔无限重试，直到显式关闭。两个队列都声明为
//! durable；prefetch 固定为 1，保证命令严格串行处理；响应以持久化
//! 投递模式发布，broker 重启后不丢失。

use crate::config::BrokerSettings;
use crate::envelope::ResponseEnvelope;
use anyhow::{Context, Result};
use lapin::options::{
    BasicConsumeOptions, BasicPublishOptions, BasicQosOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, Consumer};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, error, info};

/// 持久化投递模式（AMQP delivery-mode 2）
const DELIVERY_MODE_PERSISTENT: u8 = 2;

/// 已建立的 broker 连接
pub struct BrokerClient {
    connection: Connection,
    channel: Channel,
    settings: BrokerSettings,
}

impl BrokerClient {
    /// 带重试地建立连接；收到关闭信号时返回 None
    pub async fn connect(
        settings: &BrokerSettings,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Option<Self> {
        let delay = Duration::from_secs(settings.reconnect_delay_secs);
        loop {
            if *shutdown.borrow() {
                return None;
            }
            match Self::try_connect(settings).await {
                Ok(client) => {
                    info!(
                        host = %settings.host,
                        port = settings.port,
                        queue = %settings.command_queue,
                        "Connected to broker"
                    );
                    return Some(client);
                }
                Err(e) => {
                    error!(error = %e, delay_secs = settings.reconnect_delay_secs, "Broker connection failed, retrying");
                    tokio::select! {
                        _ = sleep(delay) => {}
                        _ = shutdown.wait_for(|stop| *stop) => return None,
                    }
                }
            }
        }
    }

    async fn try_connect(settings: &BrokerSettings) -> Result<Self> {
        let connection = Connection::connect(&settings.amqp_uri(), ConnectionProperties::default())
            .await
            .context("AMQP connection failed")?;
        let channel = connection
            .create_channel()
            .await
            .context("Failed to open AMQP channel")?;

        let durable = QueueDeclareOptions {
            durable: true,
            ..QueueDeclareOptions::default()
        };
        channel
            .queue_declare(&settings.command_queue, durable, FieldTable::default())
            .await
            .with_context(|| format!("Failed to declare queue {}", settings.command_queue))?;
        channel
            .queue_declare(&settings.response_queue, durable, FieldTable::default())
            .await
            .with_context(|| format!("Failed to declare queue {}", settings.response_queue))?;

        // 一次只处理一条在途命令
        channel
            .basic_qos(1, BasicQosOptions::default())
            .await
            .context("Failed to set prefetch")?;

        Ok(Self {
            connection,
            channel,
            settings: settings.clone(),
        })
    }

    /// 开始消费命令队列
    ///
    /// 自动确认：命令处理在 Dispatcher 边界收敛为响应，从不上抛，
    /// 所以投递即确认是安全的。
    pub async fn consume(&self, consumer_tag: &str) -> Result<Consumer> {
        let options = BasicConsumeOptions {
            no_ack: true,
            ..BasicConsumeOptions::default()
        };
        self.channel
            .basic_consume(
                &self.settings.command_queue,
                consumer_tag,
                options,
                FieldTable::default(),
            )
            .await
            .context("Failed to start consuming")
    }

    /// 发布响应到响应队列（持久化投递）
    pub async fn publish_response(&self, response: &ResponseEnvelope) -> Result<()> {
        let payload = serde_json::to_vec(response)?;
        self.channel
            .basic_publish(
                "",
                &self.settings.response_queue,
                BasicPublishOptions::default(),
                &payload,
                BasicProperties::default().with_delivery_mode(DELIVERY_MODE_PERSISTENT),
            )
            .await
            .context("Failed to publish response")?
            .await
            .context("Response publish not confirmed")?;
        debug!(
            queue = %self.settings.response_queue,
            success = response.success,
            command_id = ?response.command_id,
            "Response published"
        );
        Ok(())
    }

    /// 优雅断开
    pub async fn close(self) {
        if let Err(e) = self.connection.close(200, "shutdown").await {
            debug!(error = %e, "Broker connection close failed");
        } else {
            info!("Broker connection closed");
        }
    }
}
