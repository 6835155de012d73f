use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::errors::{SchedulerError, SchedulerResult};

/// 应用配置
///
/// TOML文件加载，`DISCHED_`前缀环境变量覆盖（分隔符`__`）。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub supervisor: SupervisorConfig,
    pub worker: WorkerConfig,
    pub registry: RegistryConfig,
    pub dispatch: DispatchConfig,
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    pub enabled: bool,
    /// 扫描循环心跳间隔
    pub scan_interval_ms: u64,
    /// 单轮扫描认领的到期任务上限
    pub scan_batch_size: usize,
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub enabled: bool,
    pub group: String,
    pub worker_id: String,
    pub host: String,
    pub port: u16,
    pub max_concurrent_tasks: usize,
    /// 时间轮转动周期
    pub tick_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// memory | redis（每进程恰好一个激活后端）
    pub backend: String,
    pub namespace: String,
    pub session_ttl_ms: u64,
    pub redis_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// http | channel
    pub transport: String,
    pub http_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub enabled: bool,
    pub bind_address: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            supervisor: SupervisorConfig {
                enabled: true,
                scan_interval_ms: 1000,
                scan_batch_size: 100,
                host: "127.0.0.1".to_string(),
                port: 8100,
            },
            worker: WorkerConfig {
                enabled: true,
                group: "default".to_string(),
                worker_id: "worker-001".to_string(),
                host: "127.0.0.1".to_string(),
                port: 8200,
                max_concurrent_tasks: 8,
                tick_interval_ms: 1000,
            },
            registry: RegistryConfig {
                backend: "memory".to_string(),
                namespace: "disched".to_string(),
                session_ttl_ms: 30_000,
                redis_url: None,
            },
            dispatch: DispatchConfig {
                transport: "channel".to_string(),
                http_timeout_ms: 5000,
            },
            api: ApiConfig {
                enabled: true,
                bind_address: "0.0.0.0:8080".to_string(),
            },
        }
    }
}

impl AppConfig {
    pub fn load(path: Option<&str>) -> SchedulerResult<AppConfig> {
        let defaults = Config::try_from(&AppConfig::default())
            .map_err(|e| SchedulerError::Configuration(e.to_string()))?;
        let mut builder = Config::builder().add_source(defaults);
        if let Some(p) = path {
            builder = builder.add_source(File::new(p, FileFormat::Toml).required(true));
        }
        builder = builder.add_source(Environment::with_prefix("DISCHED").separator("__"));

        let app_config: AppConfig = builder
            .build()
            .map_err(|e| SchedulerError::Configuration(e.to_string()))?
            .try_deserialize()
            .map_err(|e| SchedulerError::Configuration(e.to_string()))?;
        app_config.validate()?;
        Ok(app_config)
    }

    pub fn validate(&self) -> SchedulerResult<()> {
        if self.supervisor.scan_interval_ms == 0 {
            return Err(SchedulerError::config_error(
                "supervisor.scan_interval_ms 必须大于0",
            ));
        }
        if self.worker.enabled {
            if self.worker.group.is_empty() {
                return Err(SchedulerError::config_error("worker.group 不能为空"));
            }
            if self.worker.worker_id.is_empty() {
                return Err(SchedulerError::config_error("worker.worker_id 不能为空"));
            }
            if self.worker.max_concurrent_tasks == 0 {
                return Err(SchedulerError::config_error(
                    "worker.max_concurrent_tasks 必须大于0",
                ));
            }
        }
        match self.registry.backend.as_str() {
            "memory" => {}
            "redis" => {
                if self.registry.redis_url.is_none() {
                    return Err(SchedulerError::config_error(
                        "registry.backend=redis 时必须配置 registry.redis_url",
                    ));
                }
            }
            other => {
                return Err(SchedulerError::config_error(format!(
                    "不支持的注册中心后端: {other}"
                )));
            }
        }
        if !matches!(self.dispatch.transport.as_str(), "http" | "channel") {
            return Err(SchedulerError::config_error(format!(
                "不支持的派发传输: {}",
                self.dispatch.transport
            )));
        }
        if self.registry.session_ttl_ms < 3000 {
            return Err(SchedulerError::config_error(
                "registry.session_ttl_ms 不能小于3000",
            ));
        }
        Ok(())
    }

    /// 会话TTL的续约间隔：TTL/3，确保容忍一次心跳丢失
    pub fn session_renew_interval_ms(&self) -> u64 {
        self.registry.session_ttl_ms / 3
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_valid() {
        assert!(AppConfig::default().validate().is_ok());
    }

    #[test]
    fn test_load_from_toml_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            "[worker]\ngroup = \"etl\"\nworker_id = \"w-9\"\n\n[supervisor]\nscan_interval_ms = 250"
        )
        .unwrap();
        let cfg = AppConfig::load(file.path().to_str()).unwrap();
        assert_eq!(cfg.worker.group, "etl");
        assert_eq!(cfg.supervisor.scan_interval_ms, 250);
        // 未覆盖的字段保留默认值
        assert_eq!(cfg.registry.backend, "memory");
    }

    #[test]
    fn test_redis_backend_requires_url() {
        let mut cfg = AppConfig::default();
        cfg.registry.backend = "redis".to_string();
        assert!(cfg.validate().is_err());
        cfg.registry.redis_url = Some("redis://127.0.0.1/".to_string());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_renew_interval_is_sub_ttl() {
        let cfg = AppConfig::default();
        assert!(cfg.session_renew_interval_ms() * 3 <= cfg.registry.session_ttl_ms);
    }
}
