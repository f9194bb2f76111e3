//! Service wiring and lifecycle.
//!
//! # Responsibility
//! - Build collaborators from configuration.
//! - Start consumers and the cleanup loop and hand back one owning handle.
//!
//! # Invariants
//! - The authority topic is registered before any consumer starts.
//! - With the in-memory authority every stored document is granted again
//!   before consumers or the cleanup loop start.
//! - `ServiceHandle::shutdown` joins every task before closing the command log.

use crate::authority::{
    AuthorityError, HttpPermissionAuthority, InMemoryAuthority, PermissionAuthority,
};
use crate::config::ServiceConfig;
use crate::db::{open_db, open_db_in_memory, DbError};
use crate::lifecycle::{shutdown_channel, ShutdownSignal, ShutdownTrigger};
use crate::repo::process_repo::{ProcessRepository, RepoError, SqliteProcessRepository};
use crate::service::backfill::run_permission_backfill;
use crate::service::materializer::Materializer;
use crate::service::process_control::{ControlError, ProcessController};
use crate::service::reconciler::Reconciler;
use crate::source::consumer::{CommandConsumer, ConsumerExit, FatalHandler};
use crate::source::listener::build_listeners;
use crate::source::log::{CommandLog, LogError};
use crate::source::open_command_log;
use crate::source::producer::CommandProducer;
use log::{error, info};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use tokio::task::JoinHandle;

const IN_MEMORY_DATABASE: &str = ":memory:";

#[derive(Debug)]
pub enum StartError {
    Db(DbError),
    Repo(RepoError),
    Authority(AuthorityError),
    Log(LogError),
    Control(ControlError),
}

impl Display for StartError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Db(err) => write!(f, "unable to open document store: {err}"),
            Self::Repo(err) => write!(f, "unable to prepare document store: {err}"),
            Self::Authority(err) => write!(f, "unable to set up permission authority: {err}"),
            Self::Log(err) => write!(f, "unable to open command log: {err}"),
            Self::Control(err) => write!(f, "startup step failed: {err}"),
        }
    }
}

impl Error for StartError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Db(err) => Some(err),
            Self::Repo(err) => Some(err),
            Self::Authority(err) => Some(err),
            Self::Log(err) => Some(err),
            Self::Control(err) => Some(err),
        }
    }
}

impl From<DbError> for StartError {
    fn from(value: DbError) -> Self {
        Self::Db(value)
    }
}

impl From<RepoError> for StartError {
    fn from(value: RepoError) -> Self {
        Self::Repo(value)
    }
}

impl From<AuthorityError> for StartError {
    fn from(value: AuthorityError) -> Self {
        Self::Authority(value)
    }
}

impl From<LogError> for StartError {
    fn from(value: LogError) -> Self {
        Self::Log(value)
    }
}

impl From<ControlError> for StartError {
    fn from(value: ControlError) -> Self {
        Self::Control(value)
    }
}

/// Shared collaborators the service runs on.
#[derive(Clone)]
pub struct Collaborators {
    pub repo: Arc<dyn ProcessRepository>,
    pub authority: Arc<dyn PermissionAuthority>,
    pub log: Arc<dyn CommandLog>,
}

impl Collaborators {
    /// Opens the store, the authority client, and the command log named by `config`.
    pub async fn from_config(config: &ServiceConfig) -> Result<Self, StartError> {
        let conn = if config.database_path == IN_MEMORY_DATABASE {
            open_db_in_memory()?
        } else {
            open_db(&config.database_path)?
        };
        let repo: Arc<dyn ProcessRepository> = Arc::new(SqliteProcessRepository::try_new(conn)?);
        let authority: Arc<dyn PermissionAuthority> = if config.uses_local_authority() {
            info!("event=authority_init module=runtime status=ok backend=memory");
            Arc::new(InMemoryAuthority::new())
        } else {
            info!(
                "event=authority_init module=runtime status=ok backend=http url={}",
                config.permissions_url
            );
            Arc::new(HttpPermissionAuthority::new(
                &config.permissions_url,
                config.permissions_admin_token.clone(),
                config.authority_timeout(),
            )?)
        };
        let log = open_command_log(config).await?;
        Ok(Self {
            repo,
            authority,
            log,
        })
    }
}

/// Owns every background task of a running service.
pub struct ServiceHandle {
    controller: Arc<ProcessController>,
    reconciler: Arc<Reconciler>,
    log: Arc<dyn CommandLog>,
    trigger: ShutdownTrigger,
    consumers: Vec<JoinHandle<ConsumerExit>>,
    cleanup: Option<JoinHandle<()>>,
}

/// Registers the topic, runs the optional backfill, and spawns consumers and
/// the cleanup loop.
pub async fn start(
    config: &ServiceConfig,
    collaborators: Collaborators,
    fatal: FatalHandler,
) -> Result<ServiceHandle, StartError> {
    let Collaborators {
        repo,
        authority,
        log,
    } = collaborators;
    let topic = config.process_topic.as_str();
    let materializer = Materializer::new(repo);
    let producer = CommandProducer::new(Arc::clone(&log), topic, config.debug);
    let controller = Arc::new(ProcessController::new(
        materializer.clone(),
        Arc::clone(&authority),
        producer,
    ));

    controller.register_topic().await?;
    // The in-memory authority starts empty, so stored documents need their
    // grants back before the first cleanup pass diffs against it.
    if config.run_startup_migration || config.uses_local_authority() {
        let report = run_permission_backfill(&materializer, authority.as_ref(), topic).await?;
        info!(
            "event=startup_backfill module=runtime status=ok local_authority={} granted={}",
            config.uses_local_authority(),
            report.granted
        );
    }

    let (trigger, signal) = shutdown_channel();
    let consumers = build_listeners(topic, Arc::clone(&controller))
        .into_iter()
        .map(|listener| {
            CommandConsumer::new(
                listener,
                config.group_id.as_str(),
                config.retry_policy(),
                Arc::clone(&fatal),
            )
            .with_debug(config.debug)
            .spawn(Arc::clone(&log), signal.clone())
        })
        .collect::<Vec<_>>();

    let reconciler = Arc::new(
        Reconciler::new(materializer, authority, topic)
            .with_grace(config.cleanup_grace())
            .with_page_size(config.cleanup_page_size),
    );
    let cleanup = config
        .cleanup_interval()
        .map(|interval| Arc::clone(&reconciler).spawn_loop(interval, signal.clone()));

    info!(
        "event=service_start module=runtime status=ok topic={} group={} consumers={} cleanup={}",
        topic,
        config.group_id,
        consumers.len(),
        cleanup.is_some()
    );
    Ok(ServiceHandle {
        controller,
        reconciler,
        log,
        trigger,
        consumers,
        cleanup,
    })
}

impl ServiceHandle {
    pub fn controller(&self) -> &Arc<ProcessController> {
        &self.controller
    }

    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.trigger.signal()
    }

    /// Signals shutdown, joins all tasks, then closes the command log.
    ///
    /// Returns the exit state of every consumer.
    pub async fn shutdown(self) -> Vec<ConsumerExit> {
        info!("event=service_stop module=runtime status=start");
        self.trigger.trigger();
        let mut exits = Vec::with_capacity(self.consumers.len());
        for consumer in self.consumers {
            match consumer.await {
                Ok(exit) => exits.push(exit),
                Err(err) => error!(
                    "event=service_stop module=runtime status=error task=consumer error={}",
                    err
                ),
            }
        }
        if let Some(cleanup) = self.cleanup {
            if let Err(err) = cleanup.await {
                error!(
                    "event=service_stop module=runtime status=error task=cleanup error={}",
                    err
                );
            }
        }
        if let Err(err) = self.log.close().await {
            error!(
                "event=service_stop module=runtime status=error task=log_close error={}",
                err
            );
        }
        info!("event=service_stop module=runtime status=ok");
        exits
    }
}

/// Fatal handler used by the binary: flush logs and exit non-zero.
pub fn exit_process_on_fatal() -> FatalHandler {
    Arc::new(|failure| {
        error!(
            "event=fatal_exit module=runtime status=error error={}",
            failure
        );
        log::logger().flush();
        std::process::exit(1);
    })
}
