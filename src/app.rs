//! Process roles
//!
//! Startup order for every role: connect store, ensure schema, seed accounts,
//! declare queues, spawn the health monitor, serve `/isalive`, run the role
//! until Ctrl-C or a fatal health failure.

use anyhow::{Context, bail};
use std::fmt;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::config::{AppConfig, BrokerKind};
use crate::db::{Database, schema};
use crate::health::{BrokerProbe, HealthMonitor, HealthState, LedgerProbe};
use crate::intake::RequestIntake;
use crate::intake::api::{self, IntakeState};
use crate::queue::{Broker, InMemoryBroker, PgQueue};
use crate::settlement::{AuditLogger, SettlementContext, SettlementWorker, WorkerConfig};
use crate::shutdown::ShutdownSignal;
use crate::store::{InMemoryLedger, LedgerStore, PgLedger};

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Role {
    /// HTTP request intake
    Api,
    /// Settlement worker
    Worker,
    /// Audit logger
    Logger,
    /// Intake, worker and logger in one process
    All,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Api => "api",
            Role::Worker => "worker",
            Role::Logger => "logger",
            Role::All => "all",
        }
    }

    fn serves_intake(self) -> bool {
        matches!(self, Role::Api | Role::All)
    }

    fn runs_worker(self) -> bool {
        matches!(self, Role::Worker | Role::All)
    }

    fn runs_logger(self) -> bool {
        matches!(self, Role::Logger | Role::All)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Build store and broker from config and prepare both for use
pub async fn build_context(config: &AppConfig, role: Role) -> anyhow::Result<Arc<SettlementContext>> {
    let (store, broker): (Arc<dyn LedgerStore>, Arc<dyn Broker>) = match &config.database.url {
        Some(url) => {
            let db = Database::connect(url, &config.database)
                .await
                .context("Failed to connect to ledger database")?;
            schema::init_schema(db.pool())
                .await
                .context("Failed to initialize ledger schema")?;

            let ledger = PgLedger::new(db.pool().clone());
            for seed in &config.accounts {
                if ledger.seed_account(seed.id, seed.balance).await? {
                    info!(account = seed.id, balance = %seed.balance, "Account created");
                }
            }

            let broker: Arc<dyn Broker> = match config.broker.kind {
                BrokerKind::Postgres => Arc::new(PgQueue::new(
                    db.pool().clone(),
                    config.broker.poll_interval(),
                    config.broker.visibility_timeout(),
                    config.broker.redelivery_delay(),
                )),
                BrokerKind::Memory => Arc::new(InMemoryBroker::new()),
            };
            let store: Arc<dyn LedgerStore> = Arc::new(ledger);
            (store, broker)
        }
        None => {
            if config.broker.kind == BrokerKind::Postgres {
                bail!("broker.kind = postgres requires database.url (or DATABASE_URL)");
            }
            let ledger = InMemoryLedger::new();
            for seed in &config.accounts {
                ledger.open_account(seed.id, seed.balance);
            }
            let store: Arc<dyn LedgerStore> = Arc::new(ledger);
            let broker: Arc<dyn Broker> = Arc::new(InMemoryBroker::new());
            (store, broker)
        }
    };

    if config.broker.kind == BrokerKind::Memory && role != Role::All {
        warn!(
            role = %role,
            "In-memory broker only reaches consumers inside this process"
        );
    }

    for queue in [&config.queues.transfer, &config.queues.audit] {
        broker
            .declare_queue(queue)
            .await
            .with_context(|| format!("Failed to declare queue {}", queue))?;
    }

    info!(broker = broker.name(), "Settlement context ready");
    Ok(Arc::new(SettlementContext::new(
        store,
        broker,
        config.queues.clone(),
    )))
}

/// Run one process role until shutdown
pub async fn run(role: Role, config: AppConfig) -> anyhow::Result<()> {
    let ctx = build_context(&config, role).await?;
    let shutdown = Arc::new(ShutdownSignal::new());
    let health = HealthState::new();

    let router = if role.serves_intake() {
        let state = Arc::new(IntakeState {
            intake: RequestIntake::new(ctx.broker.clone(), ctx.queues.clone()),
            ledger: Some(ctx.store.clone()),
        });
        api::router(state, health.clone())
    } else {
        api::health_router(health.clone())
    };

    let addr = format!("{}:{}", config.http.host, config.http.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!(role = %role, addr = %addr, "HTTP server listening");

    let mut tasks = JoinSet::new();
    {
        let shutdown = shutdown.clone();
        tasks.spawn(async move {
            let graceful = {
                let shutdown = shutdown.clone();
                async move { shutdown.wait().await }
            };
            if let Err(e) = axum::serve(listener, router)
                .with_graceful_shutdown(graceful)
                .await
            {
                error!(error = %e, "HTTP server failed");
                shutdown.request_shutdown();
            }
        });
    }

    if role.runs_worker() {
        let worker = Arc::new(SettlementWorker::new(
            ctx.clone(),
            WorkerConfig::from(&config.worker),
        ));
        tasks.spawn(worker.run(shutdown.clone()));
    }
    if role.runs_logger() {
        let logger = Arc::new(AuditLogger::new(
            ctx.clone(),
            WorkerConfig::from(&config.logger),
        ));
        tasks.spawn(logger.run(shutdown.clone()));
    }

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Ctrl-C received, shutting down"),
                Err(e) => error!(error = %e, "Failed to listen for Ctrl-C, shutting down"),
            }
            shutdown.request_shutdown();
        });
    }

    let monitor = HealthMonitor::new(&config.health, health)
        .with_probe(Arc::new(LedgerProbe(ctx.store.clone())))
        .with_probe(Arc::new(BrokerProbe(ctx.broker.clone())));
    let verdict = monitor.run(&shutdown).await;

    shutdown.request_shutdown();
    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            error!(error = %e, "Role task panicked");
        }
    }

    verdict.context("Dependencies unreachable")?;
    info!(role = %role, "Stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AccountSeed;
    use rust_decimal::Decimal;

    fn memory_config() -> AppConfig {
        serde_yaml::from_str(
            r#"
log_level: info
log_dir: ./logs
log_file: settlement.log
use_json: false
rotation: never
http:
  host: 127.0.0.1
  port: 0
"#,
        )
        .unwrap()
    }

    #[test]
    fn test_role_capabilities() {
        assert!(Role::All.serves_intake() && Role::All.runs_worker() && Role::All.runs_logger());
        assert!(Role::Api.serves_intake() && !Role::Api.runs_worker());
        assert!(Role::Worker.runs_worker() && !Role::Worker.runs_logger());
        assert!(Role::Logger.runs_logger() && !Role::Logger.serves_intake());
        assert_eq!(Role::Logger.to_string(), "logger");
    }

    #[tokio::test]
    async fn test_memory_context_seeds_accounts() {
        let mut config = memory_config();
        config.accounts = vec![AccountSeed {
            id: 1,
            balance: Decimal::from(100),
        }];

        let ctx = build_context(&config, Role::All).await.unwrap();
        let account = ctx.store.account(1).await.unwrap().unwrap();
        assert_eq!(account.balance, Decimal::from(100));
        assert_eq!(ctx.broker.name(), "memory");
    }

    #[tokio::test]
    async fn test_postgres_broker_requires_database() {
        let mut config = memory_config();
        config.broker.kind = BrokerKind::Postgres;
        assert!(build_context(&config, Role::Worker).await.is_err());
    }
}
