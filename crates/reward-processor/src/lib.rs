//! 奖励处理服务
//!
//! 事件管道的核心：从 Kafka 消费学习事件（课程完成、章节完成等），
//! 在事务性计数存储上为事件累加计数，按规则快照评估里程碑阈值，
//! 并将触发的奖励发布到下游 topic。输入通道为至少一次投递，
//! 通过计数身份与严格相等的触发条件达成「事实上恰好一次」的奖励输出。

pub mod consumer;
pub mod emitter;
pub mod engine;
pub mod error;
pub mod models;
pub mod repository;
