//! Kafka 基础设施封装
//!
//! 将 rdkafka 的底层 API 封装为业务友好的 Producer/Consumer 抽象，
//! 统一错误映射、偏移量标记和优雅关闭语义。

use std::time::Duration;

use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Message};
use rdkafka::producer::{FutureProducer, FutureRecord};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::KafkaConfig;
use crate::error::RewardError;

// ---------------------------------------------------------------------------
// EventMessage
// ---------------------------------------------------------------------------

/// 消费到的一条事件消息
///
/// 只保留管道实际使用的字段：标记偏移量所需的 (topic, partition, offset)
/// 定位三元组，以及原始 JSON 负载。rdkafka 的 `BorrowedMessage` 受消费者
/// 生命周期约束，进入异步处理前先复制为自有结构。
#[derive(Debug, Clone)]
pub struct EventMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub payload: Vec<u8>,
}

impl EventMessage {
    fn from_borrowed(msg: &BorrowedMessage<'_>) -> Self {
        Self {
            topic: msg.topic().to_string(),
            partition: msg.partition(),
            offset: msg.offset(),
            // tombstone 等空负载按空字节处理，交由上层按畸形输入跳过
            payload: msg.payload().map(<[u8]>::to_vec).unwrap_or_default(),
        }
    }
}

// ---------------------------------------------------------------------------
// KafkaProducer
// ---------------------------------------------------------------------------

/// 面向业务的 Kafka 生产者
///
/// 封装 `FutureProducer` 并提供类型安全的 JSON 发送方法，
/// 内部已派生 Clone（`FutureProducer` 本身是 Arc 包装的）。
#[derive(Clone)]
pub struct KafkaProducer {
    producer: FutureProducer,
}

impl KafkaProducer {
    /// 根据配置创建生产者
    ///
    /// `acks=all` 要求全部同步副本确认后才算发送成功——奖励消息丢失
    /// 意味着用户拿不到应得的奖励，宁可慢也不可丢。
    /// 客户端内部最多重试 5 次，超过后错误向上传播，由消费侧
    /// 通过不提交偏移量触发消息重投。
    pub fn new(config: &KafkaConfig) -> Result<Self, RewardError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("acks", "all")
            .set("message.send.max.retries", "5")
            .set("message.timeout.ms", "5000")
            .create()
            .map_err(|e| RewardError::Kafka(format!("创建生产者失败: {e}")))?;

        info!(brokers = %config.brokers, "Kafka 生产者已初始化");
        Ok(Self { producer })
    }

    /// 发送原始字节消息，等待副本确认后返回落盘的分区与偏移量
    pub async fn send(
        &self,
        topic: &str,
        key: &str,
        payload: &[u8],
    ) -> Result<(i32, i64), RewardError> {
        let record = FutureRecord::to(topic).key(key).payload(payload);

        // rdkafka 0.39+ 返回 Delivery 结构体而非元组
        let delivery = self
            .producer
            .send(record, Duration::from_secs(5))
            .await
            .map_err(|(e, _)| RewardError::Kafka(format!("发送消息失败: {e}")))?;

        debug!(
            topic,
            key,
            partition = delivery.partition,
            offset = delivery.offset,
            "消息已发送"
        );
        Ok((delivery.partition, delivery.offset))
    }

    /// 将值序列化为 JSON 后发送
    ///
    /// 序列化与网络发送拆分为两步，便于独立定位故障原因。
    pub async fn send_json<T: Serialize>(
        &self,
        topic: &str,
        key: &str,
        value: &T,
    ) -> Result<(i32, i64), RewardError> {
        let payload = serde_json::to_vec(value)
            .map_err(|e| RewardError::Kafka(format!("序列化失败: {e}")))?;

        self.send(topic, key, &payload).await
    }
}

// ---------------------------------------------------------------------------
// KafkaConsumer
// ---------------------------------------------------------------------------

/// 面向业务的 Kafka 消费者
///
/// 封装 `StreamConsumer` 并提供基于 `watch` channel 的优雅关闭语义。
/// 偏移量采用「处理成功后标记」策略：`enable.auto.offset.store=false`
/// 关闭收取即存储，改为在 handler 成功返回后手动 `store_offset`，
/// 再由客户端 1 秒一次的自动提交周期刷出。处理失败的消息不会被标记，
/// 会话结束后重新加入即可重投。
pub struct KafkaConsumer {
    consumer: StreamConsumer,
}

impl KafkaConsumer {
    /// 创建消费者并订阅配置中的 topic 列表
    ///
    /// 本管道的消费者没有「先创建、之后再挑 topic」的场景，
    /// 订阅直接在构造时完成，每次会话重建走同一条路径。
    /// 无历史提交时从最早偏移量开始消费（`auto_offset_reset` 默认
    /// earliest），保证新消费组不会漏掉既有事件。
    pub fn new(config: &KafkaConfig) -> Result<Self, RewardError> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("group.id", &config.consumer_group)
            .set("auto.offset.reset", &config.auto_offset_reset)
            .set("enable.auto.commit", "true")
            .set("auto.commit.interval.ms", "1000")
            .set("enable.auto.offset.store", "false")
            .create()
            .map_err(|e| RewardError::Kafka(format!("创建消费者失败: {e}")))?;

        let topics = config.topic_list();
        consumer
            .subscribe(&topics)
            .map_err(|e| RewardError::Kafka(format!("订阅 topic 失败: {e}")))?;

        info!(
            brokers = %config.brokers,
            group_id = %config.consumer_group,
            ?topics,
            "Kafka 消费者已初始化并完成订阅"
        );
        Ok(Self { consumer })
    }

    /// 启动消费循环
    ///
    /// 使用 `tokio::select!` 同时监听消息流和关闭信号：
    /// - handler 返回 Ok 时标记该消息的偏移量（含主动跳过的消息），
    ///   等待自动提交刷出；
    /// - handler 返回 Err 时立即带错返回，偏移量不标记，调用方结束
    ///   本次会话后重新加入消费组，消息将被重投；
    /// - 关闭信号变为 `true` 时正常返回，正在执行的 handler 自然完成。
    ///
    /// 拉取层面的瞬时错误（如 rebalance）只记录日志，由客户端自行恢复。
    pub async fn start<F, Fut>(
        &self,
        mut shutdown: watch::Receiver<bool>,
        handler: F,
    ) -> Result<(), RewardError>
    where
        F: Fn(EventMessage) -> Fut,
        Fut: std::future::Future<Output = Result<(), RewardError>>,
    {
        use futures::StreamExt;

        let stream = self.consumer.stream();
        futures::pin_mut!(stream);

        info!("Kafka 消费循环已启动");

        loop {
            // 每轮先检查一次关闭标志，覆盖信号在订阅接收器之前就已发出的情形
            if *shutdown.borrow() {
                info!("收到关闭信号，Kafka 消费循环退出");
                return Ok(());
            }

            tokio::select! {
                // 偏向关闭信号，保证收到关闭时能尽快退出
                biased;

                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("收到关闭信号，Kafka 消费循环退出");
                        return Ok(());
                    }
                }

                msg_result = stream.next() => {
                    let Some(msg_result) = msg_result else {
                        warn!("Kafka 消息流意外结束");
                        return Err(RewardError::Kafka("消息流意外结束".to_string()));
                    };

                    // 借用消息在进入异步处理前先转换为自有结构并释放
                    let msg = match msg_result {
                        Ok(borrowed_msg) => EventMessage::from_borrowed(&borrowed_msg),
                        Err(e) => {
                            error!(error = %e, "接收 Kafka 消息出错");
                            continue;
                        }
                    };

                    debug!(
                        topic = %msg.topic,
                        partition = msg.partition,
                        offset = msg.offset,
                        "收到 Kafka 消息"
                    );

                    handler(msg.clone()).await?;

                    // 处理成功后才标记偏移量，失败的消息留待重投
                    self.consumer
                        .store_offset(&msg.topic, msg.partition, msg.offset)
                        .map_err(|e| RewardError::Kafka(format!("标记偏移量失败: {e}")))?;
                }
            }
        }
    }
}
