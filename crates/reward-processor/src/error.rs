//! 奖励处理服务专用错误类型
//!
//! 在共享库 RewardError 基础上定义本服务特有的错误变体。
//! 畸形输入不在此建模：按策略它在消费侧就地记录日志并跳过，
//! 不会作为错误向上传播。

use rewards_shared::error::RewardError;

/// 奖励处理错误
#[derive(Debug, thiserror::Error)]
pub enum ProcessorError {
    /// 规则快照构建时发现配置违反约束（count 非正、奖励金额与类型不符等），
    /// 属启动期致命错误
    #[error("规则配置无效: rule_id={rule_id}, {reason}")]
    InvalidRule { rule_id: String, reason: String },

    /// 透传共享库错误，避免在每个 match 分支手动转换
    #[error(transparent)]
    Shared(#[from] RewardError),
}
