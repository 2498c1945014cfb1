//! 奖励发布器
//!
//! 将触发的奖励序列化为 JSON 并发布到输出 topic。发送是同步语义：
//! 等待全部同步副本确认后才返回成功，客户端内部的有限重试耗尽后
//! 错误向上传播，由消费侧通过不提交偏移量换取重投。

use async_trait::async_trait;
use tracing::debug;

use rewards_shared::error::RewardError;
use rewards_shared::kafka::KafkaProducer;

use crate::models::RewardTriggered;

/// 奖励发布接口
///
/// 消费循环只依赖此 trait，测试中以记录型实现替换 Kafka。
#[async_trait]
pub trait RewardPublisher: Send + Sync {
    async fn publish(&self, reward: &RewardTriggered) -> Result<(), RewardError>;
}

/// Kafka 奖励发布器
///
/// 消息 key 取 user_id，同一用户的奖励落在同一分区，
/// 下游按 (user_id, rule_id) 去重时可以就地完成。
pub struct KafkaRewardEmitter {
    producer: KafkaProducer,
    topic: String,
}

impl KafkaRewardEmitter {
    pub fn new(producer: KafkaProducer, topic: impl Into<String>) -> Self {
        Self {
            producer,
            topic: topic.into(),
        }
    }
}

#[async_trait]
impl RewardPublisher for KafkaRewardEmitter {
    async fn publish(&self, reward: &RewardTriggered) -> Result<(), RewardError> {
        let (partition, offset) = self
            .producer
            .send_json(&self.topic, &reward.user_id, reward)
            .await?;

        debug!(
            topic = %self.topic,
            partition,
            offset,
            user_id = %reward.user_id,
            rule_id = %reward.rule_id,
            "奖励消息已发布"
        );
        Ok(())
    }
}
