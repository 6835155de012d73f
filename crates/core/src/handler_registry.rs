use std::collections::HashMap;
use std::sync::Arc;

use crate::errors::{SchedulerError, SchedulerResult};
use crate::traits::handler::{JobHandler, NoopHandler, SleepHandler};

/// 处理器注册表
///
/// 进程启动时构建一次，以Arc传给全部使用方（构造注入，无可变全局量）。
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// 带内置处理器的注册表
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register("noop", Arc::new(NoopHandler));
        registry.register("sleep", Arc::new(SleepHandler));
        registry
    }

    pub fn register(&mut self, name: &str, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(name.to_string(), handler);
    }

    pub fn get(&self, name: &str) -> SchedulerResult<Arc<dyn JobHandler>> {
        self.handlers
            .get(name)
            .cloned()
            .ok_or_else(|| SchedulerError::HandlerNotFound {
                name: name.to_string(),
            })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.handlers.keys().map(String::as_str).collect()
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_handlers_present() {
        let registry = HandlerRegistry::with_builtin();
        assert!(registry.contains("noop"));
        assert!(registry.contains("sleep"));
        assert!(registry.get("noop").is_ok());
    }

    #[test]
    fn test_unknown_handler_is_error() {
        let registry = HandlerRegistry::new();
        let err = registry.get("missing").unwrap_err();
        assert!(matches!(
            err,
            crate::errors::SchedulerError::HandlerNotFound { .. }
        ));
    }
}
