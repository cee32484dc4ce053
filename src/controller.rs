//! Agent 控制器模块 - 顶层编排
//!
//! 将 Broker → Dispatcher → Supervisor 串起来，并执行有序关闭：
//! 停止接收命令 → stop_all → 通知 monitor 退出 → 断开 broker。
//! Supervisor 在这里显式构造并注入 Dispatcher，没有全局单例。

use crate::bridge::NativeBridge;
use crate::broker::BrokerClient;
use crate::config::AgentConfig;
use crate::dispatcher::CommandDispatcher;
use crate::envelope::ResponseEnvelope;
use crate::supervisor::StreamSupervisor;
use anyhow::Result;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{error, info, warn};

/// Agent 控制器，生命周期与进程一致
pub struct AgentController {
    config: AgentConfig,
    supervisor: Arc<StreamSupervisor>,
    dispatcher: Arc<CommandDispatcher>,
    shutdown_tx: watch::Sender<bool>,
}

impl AgentController {
    pub fn new(config: AgentConfig, bridge: Arc<dyn NativeBridge>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let supervisor = Arc::new(StreamSupervisor::new(
            Arc::clone(&bridge),
            config.relay.clone(),
            shutdown_rx,
        ));
        let dispatcher = Arc::new(CommandDispatcher::new(
            config.agent_id.clone(),
            Arc::clone(&supervisor),
            bridge,
        ));
        Self {
            config,
            supervisor,
            dispatcher,
            shutdown_tx,
        }
    }

    /// 关闭信号发送端，交给信号处理任务
    pub fn shutdown_sender(&self) -> watch::Sender<bool> {
        self.shutdown_tx.clone()
    }

    /// 主循环：连接 broker，消费命令直到断线或收到关闭信号
    pub async fn run(&self) -> Result<()> {
        info!(agent_id = %self.config.agent_id, "Agent starting");
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            let Some(client) = BrokerClient::connect(&self.config.broker, &mut shutdown_rx).await
            else {
                // 连接建立前就收到了关闭信号
                self.shutdown_sequence(None).await;
                break;
            };

            let consumer_tag = format!("esa-{}", self.config.agent_id);
            let mut consumer = match client.consume(&consumer_tag).await {
                Ok(consumer) => consumer,
                Err(e) => {
                    error!(error = %e, "Failed to start consumer, reconnecting");
                    client.close().await;
                    sleep(Duration::from_secs(self.config.broker.reconnect_delay_secs)).await;
                    continue;
                }
            };

            info!(queue = %self.config.broker.command_queue, "Waiting for commands");
            let lost_connection = loop {
                tokio::select! {
                    _ = shutdown_rx.wait_for(|stop| *stop) => break false,
                    delivery = consumer.next() => match delivery {
                        Some(Ok(delivery)) => {
                            self.process_delivery(&client, delivery.data).await;
                        }
                        Some(Err(e)) => {
                            error!(error = %e, "Consume error, reconnecting");
                            break true;
                        }
                        None => {
                            warn!("Consumer stream closed by broker, reconnecting");
                            break true;
                        }
                    }
                }
            };

            if lost_connection && !*shutdown_rx.borrow() {
                client.close().await;
                sleep(Duration::from_secs(self.config.broker.reconnect_delay_secs)).await;
                continue;
            }

            self.shutdown_sequence(Some(client)).await;
            break;
        }

        Ok(())
    }

    /// 处理一条投递：在独立任务中分发，handler panic 不杀死 agent
    async fn process_delivery(&self, client: &BrokerClient, data: Vec<u8>) {
        let dispatcher = Arc::clone(&self.dispatcher);
        let outcome = tokio::spawn(async move { dispatcher.handle(&data).await }).await;

        let response = match outcome {
            Ok(response) => response,
            Err(e) => {
                error!(error = %e, "Command handler panicked");
                Some(ResponseEnvelope::failure(
                    &self.config.agent_id,
                    "Command processing error",
                    None,
                ))
            }
        };

        if let Some(response) = response {
            if let Err(e) = client.publish_response(&response).await {
                error!(error = %e, "Failed to publish response");
            }
        }
    }

    /// 有序关闭；每一步尽力执行并记录，不无限阻塞
    async fn shutdown_sequence(&self, client: Option<BrokerClient>) {
        info!("Shutting down");

        // 消费循环已退出，不再接收新命令
        self.supervisor.stop_all().await;

        // 广播关闭信号，monitor 任务据此退出
        if self.shutdown_tx.send(true).is_err() {
            warn!("No shutdown receivers left");
        }

        if let Some(client) = client {
            client.close().await;
        }
        info!("Shutdown completed");
    }
}
