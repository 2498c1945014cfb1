//! Kafka 消费循环
//!
//! 加入消费组拉取学习事件，逐条交给规则引擎评估并发布触发的奖励，
//! 全部成功后才标记偏移量。分区内严格按偏移量顺序串行处理；
//! 处理失败时结束本次会话、退避后重新加入，失败的消息随会话重建被重投。

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info, warn};

use rewards_shared::config::KafkaConfig;
use rewards_shared::error::RewardError;
use rewards_shared::kafka::{EventMessage, KafkaConsumer};

use crate::emitter::RewardPublisher;
use crate::engine::RewardEngine;
use crate::error::ProcessorError;
use crate::models::UserEvent;

/// 会话异常结束后重新加入消费组前的退避时间
const REJOIN_DELAY: Duration = Duration::from_secs(1);
/// 进度日志间隔（消息条数）
const PROGRESS_LOG_INTERVAL: u64 = 100;

/// 奖励事件消费者
///
/// 组合规则引擎（业务处理）与奖励发布器（下游投递），
/// 每次会话重建时从配置新建底层 KafkaConsumer 重新加入消费组。
pub struct RewardConsumer {
    kafka: KafkaConfig,
    engine: Arc<RewardEngine>,
    publisher: Arc<dyn RewardPublisher>,
    processed: AtomicU64,
}

impl RewardConsumer {
    pub fn new(
        kafka: KafkaConfig,
        engine: Arc<RewardEngine>,
        publisher: Arc<dyn RewardPublisher>,
    ) -> Self {
        Self {
            kafka,
            engine,
            publisher,
            processed: AtomicU64::new(0),
        }
    }

    /// 运行消费主循环，直到收到关闭信号
    ///
    /// 会话因处理失败而异常结束时，未标记的偏移量不会被提交；
    /// 退避后重建消费者重新加入消费组，从上次提交的偏移量继续，
    /// 失败的消息因此被重投。
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<(), ProcessorError> {
        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            let consumer = KafkaConsumer::new(&self.kafka)?;

            info!(
                topics = %self.kafka.consumer_topics,
                group_id = %self.kafka.consumer_group,
                "奖励事件消费者已启动"
            );

            let engine = &self.engine;
            let publisher = &self.publisher;
            let processed = &self.processed;

            let session = consumer
                .start(shutdown.clone(), |msg| async move {
                    handle_message(engine, publisher.as_ref(), &msg)
                        .await
                        .map_err(|e| match e {
                            ProcessorError::Shared(inner) => inner,
                            other => RewardError::Internal(other.to_string()),
                        })?;

                    let n = processed.fetch_add(1, Ordering::Relaxed) + 1;
                    if n % PROGRESS_LOG_INTERVAL == 0 {
                        info!(messages_processed = n, "消费进度");
                    }
                    Ok(())
                })
                .await;

            match session {
                Ok(()) => {
                    info!("奖励事件消费者已停止");
                    return Ok(());
                }
                Err(e) => {
                    error!(
                        error = %e,
                        delay_secs = REJOIN_DELAY.as_secs(),
                        "消费会话异常结束，退避后重新加入消费组"
                    );
                    tokio::time::sleep(REJOIN_DELAY).await;
                }
            }
        }
    }
}

/// 处理单条 Kafka 消息的完整流程
///
/// 拆分为独立函数而非方法，便于在测试中直接调用而无需构造完整的 Consumer。
/// 返回 Ok 表示该消息可以标记偏移量（含畸形消息按策略跳过的情形）；
/// 返回 Err 表示处理失败，调用方应中止会话等待消息重投。
pub async fn handle_message(
    engine: &RewardEngine,
    publisher: &dyn RewardPublisher,
    msg: &EventMessage,
) -> Result<(), ProcessorError> {
    // 1. 解码；畸形输入（含缺失必填字段）记录日志后跳过，不得阻塞分区
    let event: UserEvent = match serde_json::from_slice(&msg.payload) {
        Ok(event) => event,
        Err(e) => {
            warn!(
                error = %e,
                topic = %msg.topic,
                partition = msg.partition,
                offset = msg.offset,
                "事件解码失败，跳过该消息"
            );
            return Ok(());
        }
    };

    info!(
        user_id = %event.user_id,
        event_type = %event.event_type,
        category = %event.category,
        "收到学习事件"
    );

    // 2. 规则评估（内部先递增计数再遍历规则）
    let triggered = engine.evaluate_event(&event).await?;

    // 3. 逐条发布触发的奖励；任一失败则整条消息不标记偏移量
    for reward in &triggered {
        publisher.publish(reward).await?;
    }

    if !triggered.is_empty() {
        info!(
            user_id = %event.user_id,
            rewards_published = triggered.len(),
            "奖励已全部发布"
        );
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// 测试
// ---------------------------------------------------------------------------
