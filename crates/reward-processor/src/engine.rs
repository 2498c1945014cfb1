//! 规则评估引擎
//!
//! 对单个事件的处理算法：先在计数存储上递增一次（无论是否有规则命中），
//! 再按快照顺序遍历规则，计数严格等于阈值时触发奖励。
//! 严格相等（而非大于等于）使每个里程碑在计数单调递增的前提下
//! 恰好触发一次——消息重投导致的多余递增只会越过阈值，不会重复触发。

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, instrument};

use crate::error::ProcessorError;
use crate::models::{RewardKind, RewardTriggered, Rule, UserEvent};
use crate::repository::EventCountStore;

// ---------------------------------------------------------------------------
// RuleSet — 规则快照
// ---------------------------------------------------------------------------

/// 规则快照
///
/// 启动期从规则仓储加载一次，此后只读。遍历顺序即插入顺序，
/// 在进程生命周期内保持稳定。规则热更新不在本版本范围内。
pub struct RuleSet {
    rules: Vec<Rule>,
}

impl RuleSet {
    /// 构建快照，逐条校验规则约束；任一规则无效则整体拒绝加载
    pub fn new(rules: Vec<Rule>) -> Result<Self, ProcessorError> {
        for rule in &rules {
            validate_rule(rule)?;
        }
        Ok(Self { rules })
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Rule> {
        self.rules.iter()
    }
}

/// 校验单条规则的加载期约束
///
/// count 必须为正（count=1 即单次触发规则）；
/// Points 奖励金额必须为正，Badge 奖励金额恒为零。
fn validate_rule(rule: &Rule) -> Result<(), ProcessorError> {
    if rule.count < 1 {
        return Err(ProcessorError::InvalidRule {
            rule_id: rule.id.clone(),
            reason: format!("count 必须为正数，实际为 {}", rule.count),
        });
    }

    match rule.reward.kind {
        RewardKind::Points if rule.reward.amount <= 0 => Err(ProcessorError::InvalidRule {
            rule_id: rule.id.clone(),
            reason: format!("POINTS 奖励金额必须为正数，实际为 {}", rule.reward.amount),
        }),
        RewardKind::Badge if rule.reward.amount != 0 => Err(ProcessorError::InvalidRule {
            rule_id: rule.id.clone(),
            reason: format!("BADGE 奖励金额必须为零，实际为 {}", rule.reward.amount),
        }),
        _ => Ok(()),
    }
}

// ---------------------------------------------------------------------------
// RewardEngine — 评估引擎
// ---------------------------------------------------------------------------

/// 规则评估引擎
///
/// 组合只读的规则快照与事务性计数存储。引擎自身不持有任何可变状态，
/// 并发协调完全依赖计数存储的三元组主键。
pub struct RewardEngine {
    rules: RuleSet,
    counts: Arc<dyn EventCountStore>,
}

impl RewardEngine {
    pub fn new(rules: RuleSet, counts: Arc<dyn EventCountStore>) -> Self {
        Self { rules, counts }
    }

    /// 评估单个事件，返回触发的奖励序列
    ///
    /// 1. 以事件自身的 (user_id, event_type, category) 为键递增计数，
    ///    每个事件恰好递增一次，与命中规则的数量无关——同一事件类型上的
    ///    多个里程碑共享一个计数器，各自在自己的阈值上触发。
    /// 2. 计数存储出错时立即返回错误，不产生任何奖励；调用方不提交
    ///    偏移量，事件将被重投。
    /// 3. 按快照顺序评估规则：未启用、事件类型不符或条件不满足的跳过；
    ///    其余按规则的条件类目（无条件规则取空类目）查询计数，
    ///    严格等于阈值时触发。
    ///
    /// 触发事件上的 timestamp 取触发时刻的服务端时钟。
    #[instrument(skip(self, event), fields(user_id = %event.user_id, event_type = %event.event_type))]
    pub async fn evaluate_event(
        &self,
        event: &UserEvent,
    ) -> Result<Vec<RewardTriggered>, ProcessorError> {
        self.counts
            .increment(&event.user_id, &event.event_type, &event.category)
            .await?;

        let mut triggered = Vec::new();

        for rule in self.rules.iter() {
            if !rule.enabled {
                debug!(rule_id = %rule.id, "规则未启用，跳过");
                continue;
            }

            if rule.event_type != event.event_type {
                continue;
            }

            if !rule.conditions.matches(event) {
                debug!(rule_id = %rule.id, "规则条件不满足，跳过");
                continue;
            }

            let count = self
                .counts
                .get_count(&event.user_id, &event.event_type, rule.conditions.lookup_category())
                .await?;

            debug!(
                rule_id = %rule.id,
                current_count = count,
                required_count = rule.count,
                "当前里程碑计数"
            );

            if count == rule.count {
                info!(
                    rule_id = %rule.id,
                    count = rule.count,
                    reward_type = %rule.reward.kind,
                    "规则已触发"
                );
                triggered.push(RewardTriggered {
                    user_id: event.user_id.clone(),
                    rule_id: rule.id.clone(),
                    reward: rule.reward.clone(),
                    timestamp: Utc::now(),
                });
            }
        }

        debug!(rules_triggered = triggered.len(), "事件评估完成");
        Ok(triggered)
    }
}

// ---------------------------------------------------------------------------
// 单元测试
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Reward, RuleConditions};
    use crate::repository::MemoryEventCountStore;
    use async_trait::async_trait;
    use rewards_shared::error::RewardError;

    fn make_rule(
        id: &str,
        event_type: &str,
        count: i32,
        conditions: RuleConditions,
        reward: Reward,
        enabled: bool,
    ) -> Rule {
        Rule {
            id: id.to_string(),
            event_type: event_type.to_string(),
            count,
            conditions,
            reward,
            enabled,
        }
    }

    /// 场景测试使用的规则组：数学徽章、数学里程碑、无条件里程碑、停用规则
    fn fixture_rules() -> Vec<Rule> {
        vec![
            make_rule(
                "rule-001",
                "COURSE_COMPLETED",
                1,
                RuleConditions::category("MATH"),
                Reward::badge("Finished Math"),
                true,
            ),
            make_rule(
                "rule-002",
                "COURSE_COMPLETED",
                5,
                RuleConditions::category("MATH"),
                Reward::points(100, "5 math"),
                true,
            ),
            make_rule(
                "rule-003",
                "COURSE_COMPLETED",
                3,
                RuleConditions::none(),
                Reward::points(30, "3 any"),
                true,
            ),
            make_rule(
                "rule-004",
                "CHAPTER_COMPLETED",
                10,
                RuleConditions::none(),
                Reward::points(10, "10 chapters"),
                false,
            ),
        ]
    }

    fn make_engine(rules: Vec<Rule>) -> (RewardEngine, Arc<MemoryEventCountStore>) {
        let store = Arc::new(MemoryEventCountStore::new());
        let engine = RewardEngine::new(RuleSet::new(rules).unwrap(), store.clone());
        (engine, store)
    }

    fn course_completed(user_id: &str, category: &str) -> UserEvent {
        UserEvent {
            user_id: user_id.to_string(),
            event_type: "COURSE_COMPLETED".to_string(),
            course_id: format!("course-{}", category.to_lowercase()),
            category: category.to_string(),
            timestamp: Utc::now(),
        }
    }

    /// 首个数学课程完成事件触发单次徽章规则
    #[tokio::test]
    async fn test_single_shot_rule_fires_on_first_event() {
        let (engine, store) = make_engine(fixture_rules());
        let event = course_completed("u-001", "MATH");

        let triggered = engine.evaluate_event(&event).await.unwrap();

        assert_eq!(triggered.len(), 1);
        assert_eq!(triggered[0].rule_id, "rule-001");
        assert_eq!(triggered[0].user_id, "u-001");
        assert_eq!(triggered[0].reward, Reward::badge("Finished Math"));
        assert_eq!(
            store.get_count("u-001", "COURSE_COMPLETED", "MATH").await.unwrap(),
            1
        );
    }

    /// 里程碑规则仅在第五个事件上触发一次
    #[tokio::test]
    async fn test_milestone_fires_exactly_at_threshold() {
        let (engine, store) = make_engine(fixture_rules());
        let event = course_completed("u-001", "MATH");

        let mut fired_rule_002 = 0;
        for _ in 0..5 {
            let triggered = engine.evaluate_event(&event).await.unwrap();
            fired_rule_002 += triggered.iter().filter(|t| t.rule_id == "rule-002").count();
        }

        assert_eq!(fired_rule_002, 1);
        assert_eq!(
            store.get_count("u-001", "COURSE_COMPLETED", "MATH").await.unwrap(),
            5
        );
    }

    /// 无条件规则按空类目查询计数，非空类目的事件不会触发它
    #[tokio::test]
    async fn test_unconditioned_rule_reads_empty_category() {
        let (engine, store) = make_engine(fixture_rules());
        let event = course_completed("u-001", "SCIENCE");

        // rule-003 要求计数到 3，但它查询的是空类目的计数行，
        // SCIENCE 事件累加在 SCIENCE 行上，永远不会满足
        for _ in 0..3 {
            let triggered = engine.evaluate_event(&event).await.unwrap();
            assert!(triggered.is_empty());
        }

        assert_eq!(
            store.get_count("u-001", "COURSE_COMPLETED", "SCIENCE").await.unwrap(),
            3
        );
        assert_eq!(store.get_count("u-001", "COURSE_COMPLETED", "").await.unwrap(), 0);
    }

    /// 类目为空串的事件与无条件规则在空类目行上汇合并触发
    #[tokio::test]
    async fn test_empty_category_event_triggers_unconditioned_rule() {
        let (engine, _store) = make_engine(fixture_rules());
        let event = course_completed("u-001", "");

        let mut fired_rule_003 = 0;
        for _ in 0..3 {
            let triggered = engine.evaluate_event(&event).await.unwrap();
            fired_rule_003 += triggered.iter().filter(|t| t.rule_id == "rule-003").count();
        }

        assert_eq!(fired_rule_003, 1);
    }

    /// 停用的规则永不触发，但事件计数照常递增
    #[tokio::test]
    async fn test_disabled_rule_never_fires() {
        let (engine, store) = make_engine(fixture_rules());
        let event = UserEvent {
            user_id: "u-001".to_string(),
            event_type: "CHAPTER_COMPLETED".to_string(),
            course_id: "course-math-101".to_string(),
            category: "MATH".to_string(),
            timestamp: Utc::now(),
        };

        for _ in 0..10 {
            let triggered = engine.evaluate_event(&event).await.unwrap();
            assert!(triggered.is_empty());
        }

        assert_eq!(
            store.get_count("u-001", "CHAPTER_COMPLETED", "MATH").await.unwrap(),
            10
        );
    }

    /// 没有任何规则匹配的事件仍然恰好递增一次计数
    #[tokio::test]
    async fn test_unmatched_event_still_increments_once() {
        let (engine, store) = make_engine(fixture_rules());
        let event = UserEvent {
            user_id: "u-001".to_string(),
            event_type: "QUIZ_PASSED".to_string(),
            course_id: "course-math-101".to_string(),
            category: "MATH".to_string(),
            timestamp: Utc::now(),
        };

        let triggered = engine.evaluate_event(&event).await.unwrap();

        assert!(triggered.is_empty());
        assert_eq!(store.get_count("u-001", "QUIZ_PASSED", "MATH").await.unwrap(), 1);
    }

    /// 消息重投：计数继续前进，越过阈值后不再重复触发
    #[tokio::test]
    async fn test_redelivery_advances_count_without_refiring() {
        let (engine, store) = make_engine(fixture_rules());
        let event = course_completed("u-001", "MATH");

        for _ in 0..5 {
            engine.evaluate_event(&event).await.unwrap();
        }

        // 第五个事件发布失败后被重投，计数到 6，rule-002 不再触发
        let triggered = engine.evaluate_event(&event).await.unwrap();
        assert!(triggered.iter().all(|t| t.rule_id != "rule-002"));
        assert_eq!(
            store.get_count("u-001", "COURSE_COMPLETED", "MATH").await.unwrap(),
            6
        );
    }

    /// 同一事件类型上的两个里程碑共享一个计数器，各自在阈值上触发
    #[tokio::test]
    async fn test_milestones_share_one_counter() {
        let rules = vec![
            make_rule(
                "rule-a",
                "COURSE_COMPLETED",
                2,
                RuleConditions::category("MATH"),
                Reward::points(20, "2 math"),
                true,
            ),
            make_rule(
                "rule-b",
                "COURSE_COMPLETED",
                4,
                RuleConditions::category("MATH"),
                Reward::points(40, "4 math"),
                true,
            ),
        ];
        let (engine, store) = make_engine(rules);
        let event = course_completed("u-001", "MATH");

        let mut fired = Vec::new();
        for _ in 0..4 {
            let triggered = engine.evaluate_event(&event).await.unwrap();
            fired.extend(triggered.into_iter().map(|t| t.rule_id));
        }

        assert_eq!(fired, vec!["rule-a".to_string(), "rule-b".to_string()]);
        // 两条规则只递增了一个计数器
        assert_eq!(
            store.get_count("u-001", "COURSE_COMPLETED", "MATH").await.unwrap(),
            4
        );
    }

    /// 计数存储故障时评估中止，不产生任何奖励
    #[tokio::test]
    async fn test_store_error_aborts_evaluation() {
        struct FailingStore;

        #[async_trait]
        impl EventCountStore for FailingStore {
            async fn increment(&self, _: &str, _: &str, _: &str) -> Result<(), RewardError> {
                Err(RewardError::Database(sqlx::Error::PoolTimedOut))
            }

            async fn get_count(&self, _: &str, _: &str, _: &str) -> Result<i32, RewardError> {
                Err(RewardError::Database(sqlx::Error::PoolTimedOut))
            }
        }

        let engine = RewardEngine::new(
            RuleSet::new(fixture_rules()).unwrap(),
            Arc::new(FailingStore),
        );
        let event = course_completed("u-001", "MATH");

        let result = engine.evaluate_event(&event).await;
        assert!(result.is_err());
    }

    /// count=0 的规则在快照构建时被拒绝
    #[test]
    fn test_zero_count_rule_rejected_at_load() {
        let rules = vec![make_rule(
            "rule-zero",
            "COURSE_COMPLETED",
            0,
            RuleConditions::none(),
            Reward::points(10, "invalid"),
            true,
        )];

        let result = RuleSet::new(rules);
        assert!(matches!(
            result,
            Err(ProcessorError::InvalidRule { rule_id, .. }) if rule_id == "rule-zero"
        ));
    }

    /// POINTS 奖励金额必须为正
    #[test]
    fn test_points_reward_with_zero_amount_rejected() {
        let rules = vec![make_rule(
            "rule-bad-points",
            "COURSE_COMPLETED",
            1,
            RuleConditions::none(),
            Reward {
                kind: RewardKind::Points,
                amount: 0,
                description: "bad".to_string(),
            },
            true,
        )];

        assert!(RuleSet::new(rules).is_err());
    }

    /// BADGE 奖励金额必须为零
    #[test]
    fn test_badge_reward_with_amount_rejected() {
        let rules = vec![make_rule(
            "rule-bad-badge",
            "COURSE_COMPLETED",
            1,
            RuleConditions::none(),
            Reward {
                kind: RewardKind::Badge,
                amount: 10,
                description: "bad".to_string(),
            },
            true,
        )];

        assert!(RuleSet::new(rules).is_err());
    }

    #[test]
    fn test_rule_set_len() {
        let set = RuleSet::new(fixture_rules()).unwrap();
        assert_eq!(set.len(), 4);
        assert!(!set.is_empty());

        let empty = RuleSet::new(vec![]).unwrap();
        assert!(empty.is_empty());
    }
}
