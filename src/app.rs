use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info};

use disched_api::{create_routes, AppState};
use disched_core::config::AppConfig;
use disched_core::counter::{AtomicCounter, MemoryAtomicCounter};
use disched_core::memory::MemoryStore;
use disched_core::models::{ServerIdentity, ServerRole};
use disched_core::HandlerRegistry;
use disched_dispatch::{
    ChannelTaskDispatcher, HttpTaskDispatcher, HttpTaskReporter, ReliableDispatcher,
    TaskDispatcher,
};
use disched_registry::{
    build_registry, spawn_session_keeper, ExclusiveRegistryGuard, MemoryRegistryHub,
    RedisAtomicCounter, ServerRegistry,
};
use disched_supervisor::{
    run_scan_loop, ExecutionRouter, JobSplitter, LifecycleService, SupervisorEngine,
};
use disched_worker::{rpc_routes, run_wheel_loop, RpcState, WorkerService};

/// 派发失败前的同步重试次数
const DISPATCH_MAX_ATTEMPTS: u32 = 3;
const DISPATCH_RETRY_DELAY_MS: u64 = 500;
/// Worker时间轮槽数（一圈）
const WHEEL_SLOTS: usize = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppMode {
    Supervisor,
    Worker,
    All,
}

impl AppMode {
    fn supervisor_active(&self) -> bool {
        matches!(self, AppMode::Supervisor | AppMode::All)
    }

    fn worker_active(&self) -> bool {
        matches!(self, AppMode::Worker | AppMode::All)
    }
}

/// 装配完成的应用
///
/// 单二进制承载supervisor与worker两种角色；进程内联调用channel
/// 传输把两侧直连，多进程部署用http传输经注册中心互相发现。
pub struct Application {
    config: AppConfig,
    mode: AppMode,
    registry: Arc<dyn ServerRegistry>,
    supervisor: Option<SupervisorParts>,
    worker: Option<WorkerParts>,
}

struct SupervisorParts {
    identity: ServerIdentity,
    engine: Arc<SupervisorEngine>,
    api_router: Option<Router>,
}

struct WorkerParts {
    identity: ServerIdentity,
    service: Arc<WorkerService>,
    rpc_router: Router,
}

impl Application {
    pub async fn new(config: AppConfig, mode: AppMode) -> Result<Self> {
        let store = Arc::new(MemoryStore::new());
        let handlers = Arc::new(HandlerRegistry::with_builtin());

        let guard = ExclusiveRegistryGuard::new();
        let hub = Arc::new(MemoryRegistryHub::new());
        let registry = build_registry(&config.registry, &guard, hub)
            .await
            .context("注册中心初始化失败")?;

        if mode == AppMode::Worker && config.dispatch.transport == "channel" {
            anyhow::bail!("channel传输要求supervisor与worker同进程，worker单独模式请用http");
        }

        // 派发传输：进程内channel或跨进程http
        let channel = Arc::new(ChannelTaskDispatcher::new());
        let transport: Arc<dyn TaskDispatcher> = match config.dispatch.transport.as_str() {
            "channel" => channel.clone(),
            _ => Arc::new(HttpTaskDispatcher::new(
                store.clone(),
                config.dispatch.http_timeout_ms,
            )?),
        };
        let dispatcher = Arc::new(ReliableDispatcher::new(
            transport,
            store.clone(),
            DISPATCH_MAX_ATTEMPTS,
            DISPATCH_RETRY_DELAY_MS,
        ));
        let lifecycle = Arc::new(LifecycleService::new(
            store.clone(),
            store.clone(),
            store.clone(),
            store.clone(),
            store.clone(),
            dispatcher.clone(),
        ));

        let supervisor = if mode.supervisor_active() {
            let identity = ServerIdentity::new(
                &config.worker.group,
                &format!("sup-{}", local_hostname()),
                &config.supervisor.host,
                config.supervisor.port,
            );
            // 多副本部署时轮询计数器放到Redis，保证集群级公平
            let counter: Arc<dyn AtomicCounter> = match (
                config.registry.backend.as_str(),
                config.registry.redis_url.as_deref(),
            ) {
                ("redis", Some(url)) => Arc::new(
                    RedisAtomicCounter::connect(
                        url,
                        &format!("{}:route:counter", config.registry.namespace),
                        config.registry.session_ttl_ms,
                    )
                    .await?,
                ),
                _ => Arc::new(MemoryAtomicCounter::new()),
            };
            let engine = Arc::new(SupervisorEngine::new(
                store.clone(),
                store.clone(),
                store.clone(),
                store.clone(),
                store.clone(),
                JobSplitter::new(handlers.clone()),
                ExecutionRouter::new(counter, identity.clone()),
                dispatcher.clone(),
                registry.clone(),
                lifecycle.clone(),
                config.supervisor.scan_batch_size,
            ));
            let api_router = config.api.enabled.then(|| {
                create_routes(AppState {
                    jobs: store.clone(),
                    instances: store.clone(),
                    tasks: store.clone(),
                    splitter: Arc::new(JobSplitter::new(handlers.clone())),
                    engine: engine.clone(),
                })
            });
            Some(SupervisorParts {
                identity,
                engine,
                api_router,
            })
        } else {
            None
        };

        let worker = if mode.worker_active() {
            let identity = ServerIdentity::new(
                &config.worker.group,
                &config.worker.worker_id,
                &config.worker.host,
                config.worker.port,
            );
            // 汇报通道与派发传输对称：channel直连本进程lifecycle，http走发现
            let reporter: Arc<dyn disched_core::traits::TaskReporter> =
                match config.dispatch.transport.as_str() {
                    "channel" => lifecycle.clone(),
                    _ => Arc::new(HttpTaskReporter::new(
                        registry.clone(),
                        config.dispatch.http_timeout_ms,
                    )?),
                };
            let service = Arc::new(WorkerService::new(
                identity.clone(),
                handlers.clone(),
                reporter,
                config.worker.max_concurrent_tasks,
                config.worker.tick_interval_ms,
                WHEEL_SLOTS,
            ));
            if config.dispatch.transport == "channel" {
                channel
                    .register_receiver(identity.registry_key(), service.clone())
                    .await;
            }
            let rpc_router = rpc_routes(RpcState {
                service: service.clone(),
                groups: store.clone(),
            });
            Some(WorkerParts {
                identity,
                service,
                rpc_router,
            })
        } else {
            None
        };

        Ok(Self {
            config,
            mode,
            registry,
            supervisor,
            worker,
        })
    }

    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        // 内部扇出：外部单一信号转发给全部组件
        let (tx, _) = broadcast::channel::<()>(16);
        let mut handles: Vec<JoinHandle<()>> = Vec::new();
        let renew_interval = self.config.session_renew_interval_ms();

        if let Some(sup) = self.supervisor {
            info!("启动supervisor: {}", sup.identity);
            handles.push(
                spawn_session_keeper(
                    self.registry.clone(),
                    ServerRole::Supervisor,
                    sup.identity.clone(),
                    renew_interval,
                    tx.subscribe(),
                )
                .await
                .context("supervisor注册失败")?,
            );
            handles.push(run_scan_loop(
                sup.engine,
                self.config.supervisor.scan_interval_ms,
                tx.subscribe(),
            ));
            if let Some(router) = sup.api_router {
                handles.push(
                    serve(router, &self.config.api.bind_address, "管理API", tx.subscribe())
                        .await?,
                );
            }
        }

        if let Some(worker) = self.worker {
            info!("启动worker: {}", worker.identity);
            handles.push(
                spawn_session_keeper(
                    self.registry.clone(),
                    ServerRole::Worker,
                    worker.identity.clone(),
                    renew_interval,
                    tx.subscribe(),
                )
                .await
                .context("worker注册失败")?,
            );
            handles.push(run_wheel_loop(
                worker.service,
                self.config.worker.tick_interval_ms,
                tx.subscribe(),
            ));
            let bind = format!("{}:{}", worker.identity.host, worker.identity.port);
            handles.push(serve(worker.rpc_router, &bind, "Worker RPC", tx.subscribe()).await?);
        }

        info!("应用已启动（模式: {:?}）", self.mode);
        let _ = shutdown_rx.recv().await;
        let _ = tx.send(());

        for handle in handles {
            if let Err(e) = handle.await {
                error!("组件退出异常: {e}");
            }
        }
        self.registry
            .close()
            .await
            .unwrap_or_else(|e| error!("注册中心关闭失败: {e}"));
        info!("全部组件已停止");
        Ok(())
    }
}

async fn serve(
    router: Router,
    bind_address: &str,
    name: &'static str,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<JoinHandle<()>> {
    let listener = tokio::net::TcpListener::bind(bind_address)
        .await
        .with_context(|| format!("{name}绑定 {bind_address} 失败"))?;
    info!("{name}监听 {bind_address}");
    Ok(tokio::spawn(async move {
        let graceful = async move {
            let _ = shutdown.recv().await;
        };
        if let Err(e) = axum::serve(listener, router)
            .with_graceful_shutdown(graceful)
            .await
        {
            error!("{name}服务错误: {e}");
        }
    }))
}

fn local_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}
