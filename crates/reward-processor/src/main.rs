//! 奖励处理 worker
//!
//! 启动顺序：日志 -> 配置 -> 数据库 -> 规则快照 -> 引擎 -> Kafka -> 消费循环。
//! 任一引导步骤失败即以非零退出码结束进程；收到 SIGINT/SIGTERM 后
//! 在有界宽限期内排空在途消息并释放资源。

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tracing::{error, info, warn};

use reward_processor::consumer::RewardConsumer;
use reward_processor::emitter::KafkaRewardEmitter;
use reward_processor::engine::{RewardEngine, RuleSet};
use reward_processor::repository::{PgEventCountStore, PgRuleRepository, RuleRepository};
use rewards_shared::config::AppConfig;
use rewards_shared::database::Database;
use rewards_shared::kafka::KafkaProducer;

/// 关闭宽限期：超时后放弃在途工作
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::load("reward-processor").context("加载配置失败")?;
    rewards_shared::observability::init(&config.observability).context("初始化日志失败")?;

    info!(environment = %config.environment, "reward-processor 启动中...");

    let db = Database::connect(&config.database)
        .await
        .context("连接数据库失败")?;

    let count_store = Arc::new(PgEventCountStore::new(db.pool().clone()));
    let rule_repo = PgRuleRepository::new(db.pool().clone());

    let rules = rule_repo
        .get_enabled_rules()
        .await
        .context("加载规则失败")?;
    let rule_set = RuleSet::new(rules).context("规则快照校验失败")?;
    info!(rule_count = rule_set.len(), "规则快照已加载");

    let engine = Arc::new(RewardEngine::new(rule_set, count_store));

    let producer = KafkaProducer::new(&config.kafka).context("创建 Kafka 生产者失败")?;
    let emitter = Arc::new(KafkaRewardEmitter::new(
        producer,
        &config.kafka.producer_topic,
    ));

    let consumer = RewardConsumer::new(config.kafka.clone(), engine, emitter);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let health_handle = tokio::spawn(start_health_server(config.server_addr(), db.clone()));
    let consumer_handle = tokio::spawn(consumer.run(shutdown_rx));

    shutdown_signal().await;
    info!("收到关闭信号，开始优雅关闭...");
    let _ = shutdown_tx.send(true);

    // 在宽限期内等待消费循环排空当前消息；超时后放弃在途工作
    match tokio::time::timeout(SHUTDOWN_GRACE, consumer_handle).await {
        Ok(Ok(Ok(()))) => info!("消费循环已退出"),
        Ok(Ok(Err(e))) => error!(error = %e, "消费循环异常退出"),
        Ok(Err(e)) => error!(error = %e, "消费任务 join 失败"),
        Err(_) => warn!(
            grace_secs = SHUTDOWN_GRACE.as_secs(),
            "等待消费循环超时，放弃在途工作"
        ),
    }

    health_handle.abort();
    db.close().await;

    info!("reward-processor 已关闭");
    Ok(())
}

/// 健康检查 HTTP 服务器
///
/// /health 只报告进程存活；/ready 额外探测计数库连通性，
/// 数据库不可达时返回 503，编排器据此暂停把分区流量调度过来。
/// 使用原生 TCP 实现避免额外依赖，对仅返回固定 JSON 的探针已足够。
async fn start_health_server(addr: String, db: Database) {
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(error = %e, addr = %addr, "健康检查服务器绑定地址失败");
            return;
        }
    };

    info!(addr = %addr, "健康检查 HTTP 服务器已启动");

    loop {
        let (mut stream, _) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(error = %e, "接受健康检查连接失败");
                continue;
            }
        };

        let db = db.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            let n = match tokio::io::AsyncReadExt::read(&mut stream, &mut buf).await {
                Ok(n) => n,
                Err(_) => return,
            };

            let request = String::from_utf8_lossy(&buf[..n]);

            let response = if request.contains("GET /ready") {
                if db.ping().await.is_ok() {
                    "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\n\r\n{\"status\":\"ok\"}"
                } else {
                    "HTTP/1.1 503 Service Unavailable\r\nContent-Type: application/json\r\n\r\n{\"status\":\"degraded\"}"
                }
            } else if request.contains("GET /health") {
                "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\n\r\n{\"status\":\"ok\"}"
            } else {
                "HTTP/1.1 404 Not Found\r\nContent-Length: 9\r\n\r\nNot Found"
            };

            let _ = stream.write_all(response.as_bytes()).await;
        });
    }
}

/// 监听操作系统关闭信号
///
/// 同时监听 SIGINT（Ctrl+C）和 SIGTERM（容器编排发送），
/// 任一信号到达即触发优雅关闭流程。
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("注册 SIGTERM 信号失败");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
