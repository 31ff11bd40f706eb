// Process bootstrap
//
// Service constructors are registered in an explicit factory passed to the
// bootstrap, keyed by the service-type name the environment selects. The
// program wires environment, context and service together and tears them
// down again on signal.

use crate::cluster::Backend;
use crate::config::Environ;
use crate::error::{NetError, Result};
use crate::gateway::Gateway;
use crate::packet::NodeId;
use crate::protocol::SERVICE_GATEWAY;
use crate::runtime::Clock;
use crate::service::{Service, ServiceContext};
use std::sync::Arc;

/// Builds a service given the environment and the resolved dependency
/// service-type ids.
pub type ServiceCtor = Box<dyn Fn(&Arc<Environ>, &[u8]) -> Result<Arc<dyn Service>> + Send + Sync>;

struct ServiceEntry {
    name: &'static str,
    id: u8,
    ctor: ServiceCtor,
}

/// The finite set of services this binary can host.
#[derive(Default)]
pub struct ServiceRegistry {
    entries: Vec<ServiceEntry>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the built-in services.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("gate", SERVICE_GATEWAY, |env, _deps| {
            Ok(Gateway::new(env, Clock::system()) as Arc<dyn Service>)
        });
        registry
    }

    pub fn register<F>(&mut self, name: &'static str, id: u8, ctor: F)
    where
        F: Fn(&Arc<Environ>, &[u8]) -> Result<Arc<dyn Service>> + Send + Sync + 'static,
    {
        self.entries.push(ServiceEntry {
            name,
            id,
            ctor: Box::new(ctor),
        });
    }

    /// Register a plain cluster backend under `name`.
    pub fn register_backend(&mut self, name: &'static str, id: u8) {
        self.register(name, id, move |env, deps| {
            Ok(Backend::new(id, name, env, Clock::system(), deps.to_vec()) as Arc<dyn Service>)
        });
    }

    pub fn type_of(&self, name: &str) -> Option<u8> {
        self.entries
            .iter()
            .find(|e| e.name.eq_ignore_ascii_case(name))
            .map(|e| e.id)
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.entries.iter().map(|e| e.name).collect()
    }

    /// Resolve dependency names into service-type ids.
    pub fn dependency_types(&self, names: &[String]) -> Result<Vec<u8>> {
        names
            .iter()
            .map(|name| {
                self.type_of(name).ok_or_else(|| {
                    NetError::Configuration(format!("unrecognized dependency [{name}]"))
                })
            })
            .collect()
    }

    pub fn create(&self, name: &str, env: &Arc<Environ>) -> Result<Arc<dyn Service>> {
        let entry = self
            .entries
            .iter()
            .find(|e| e.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| NetError::Configuration(format!("unrecognized service [{name}]")))?;
        let deps = self.dependency_types(&env.service_dependency)?;
        (entry.ctor)(env, &deps)
    }
}

/// A running service instance plus its context.
pub struct Program {
    env: Arc<Environ>,
    ctx: Arc<ServiceContext>,
    service: Arc<dyn Service>,
}

impl std::fmt::Debug for Program {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Program")
            .field("env", &self.env)
            .finish_non_exhaustive()
    }
}

impl Program {
    pub async fn start(registry: &ServiceRegistry, env: Arc<Environ>) -> Result<Program> {
        if env.service_type.is_empty() {
            return Err(NetError::Configuration(
                "APP_SERVICE_TYPE not specified".to_string(),
            ));
        }
        let service = registry.create(&env.service_type, &env)?;
        let node = NodeId::backend(service.id(), env.service_index);
        service.set_node(node);

        tracing::info!("service type: {}", env.service_type);
        tracing::info!("service node: {node}");
        tracing::info!("service dependency: {:?}", env.service_dependency);

        let ctx = ServiceContext::new(Arc::clone(&env), Clock::system());
        ctx.start(Arc::clone(&service)).await?;
        tracing::info!("{} service started", service.name());
        Ok(Program { env, ctx, service })
    }

    pub fn env(&self) -> &Arc<Environ> {
        &self.env
    }

    pub fn context(&self) -> &Arc<ServiceContext> {
        &self.ctx
    }

    pub fn service(&self) -> &Arc<dyn Service> {
        &self.service
    }

    /// Block until SIGINT/SIGTERM.
    pub async fn wait_for_signal(&self) {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!("wait for signal: {err}");
        }
        tracing::info!("signal received, start shutdown {} service", self.service.name());
    }

    pub async fn shutdown(&self) {
        self.ctx.shutdown().await;
        tracing::info!("{} service stopped", self.service.name());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_resolves_names_case_insensitively() {
        let mut registry = ServiceRegistry::with_defaults();
        registry.register_backend("game", 0x05);
        assert_eq!(registry.type_of("GATE"), Some(SERVICE_GATEWAY));
        assert_eq!(registry.type_of("game"), Some(0x05));
        assert_eq!(registry.type_of("nosuch"), None);
        assert_eq!(registry.names(), vec!["gate", "game"]);
    }

    #[test]
    fn dependency_resolution() {
        let mut registry = ServiceRegistry::with_defaults();
        registry.register_backend("game", 0x05);
        let deps = registry
            .dependency_types(&["gate".to_string(), "game".to_string()])
            .unwrap();
        assert_eq!(deps, vec![SERVICE_GATEWAY, 0x05]);
        assert!(registry.dependency_types(&["bogus".to_string()]).is_err());
    }

    #[tokio::test]
    async fn unknown_service_type_fails_startup() {
        let registry = ServiceRegistry::with_defaults();
        let mut env = Environ::default();
        env.service_type = "nosuch".to_string();
        let err = Program::start(&registry, Arc::new(env)).await.unwrap_err();
        assert!(matches!(err, NetError::Configuration(_)));
    }

    #[tokio::test]
    async fn empty_service_type_fails_startup() {
        let registry = ServiceRegistry::with_defaults();
        let env = Environ::default();
        let err = Program::start(&registry, Arc::new(env)).await.unwrap_err();
        assert!(matches!(err, NetError::Configuration(_)));
    }
}
