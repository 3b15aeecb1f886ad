//! Hosted applications and how they are loaded
//!
//! A service's `file` is an application manifest: a TOML document whose
//! top-level tables are named bindings. Each binding names a registered
//! handler kind plus its settings:
//!
//! ```toml
//! [application]
//! handler = "static"
//! root = "public"
//! ```
//!
//! The service's `application` key selects the binding to instantiate, or,
//! when `create` is set, the binding used as a factory that also receives the
//! service's `args`. Handler kinds are compiled in and registered on an
//! [`ApplicationRegistry`]; loading never touches process-global state, the
//! search path and environment overrides travel in the [`LoadContext`].

use crate::config::ServiceConfig;
use crate::error::LoadError;
use futures::future::BoxFuture;
use hyper::body::Bytes;
use hyper::{Request, Response};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use toml::{Table, Value};

/// Future returned by [`Application::call`]
pub type AppFuture = BoxFuture<'static, anyhow::Result<Response<Bytes>>>;

/// The capability a loaded application provides: handle one request.
pub trait Application: Send + Sync + 'static {
    fn call(&self, request: Request<Bytes>) -> AppFuture;
}

/// Request extension naming the service that accepted the request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceTag(pub String);

/// Builds an application from a manifest binding
pub type HandlerFactory =
    Arc<dyn Fn(&LoadContext<'_>) -> anyhow::Result<Arc<dyn Application>> + Send + Sync>;

/// What to load for a service
#[derive(Debug, Clone, PartialEq)]
pub struct AppDescriptor {
    pub service: String,
    pub file: PathBuf,
    pub binding: String,
    pub factory: bool,
    pub args: Option<Value>,
    pub search_path: Vec<PathBuf>,
    pub env: HashMap<String, String>,
}

impl From<&ServiceConfig> for AppDescriptor {
    fn from(config: &ServiceConfig) -> Self {
        let (binding, factory) = match &config.create {
            Some(name) => (name.clone(), true),
            None => (config.application.clone(), false),
        };
        Self {
            service: config.name.clone(),
            file: config.file.clone(),
            binding,
            factory,
            args: config.args.clone(),
            search_path: config.search_path.clone(),
            env: config.env.clone(),
        }
    }
}

/// Everything a handler factory gets to see while building an application
pub struct LoadContext<'a> {
    pub service: &'a str,
    pub source_file: &'a Path,
    pub binding: &'a str,
    pub settings: &'a Table,
    /// Factory arguments; `None` unless the binding was selected with `create`
    pub args: Option<&'a Value>,
    pub search_path: &'a [PathBuf],
    pub env: &'a HashMap<String, String>,
}

impl LoadContext<'_> {
    /// Directory containing the manifest
    pub fn base_dir(&self) -> &Path {
        self.source_file.parent().unwrap_or_else(|| Path::new("."))
    }

    /// Resolve a path relative to the manifest directory
    pub fn resolve(&self, path: impl AsRef<Path>) -> PathBuf {
        let path = path.as_ref();
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir().join(path)
        }
    }

    /// Look up a setting, preferring factory arguments over the binding's own settings
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.args
            .and_then(Value::as_table)
            .and_then(|args| args.get(key))
            .or_else(|| self.settings.get(key))
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }
}

/// An application instance together with where it came from
#[derive(Clone)]
pub struct LoadedApp {
    pub handler: String,
    pub binding: String,
    pub app: Arc<dyn Application>,
}

impl std::fmt::Debug for LoadedApp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedApp")
            .field("handler", &self.handler)
            .field("binding", &self.binding)
            .finish_non_exhaustive()
    }
}

/// Registered handler kinds
#[derive(Clone, Default)]
pub struct ApplicationRegistry {
    handlers: HashMap<String, HandlerFactory>,
}

impl ApplicationRegistry {
    /// Registry with no handlers at all
    pub fn empty() -> Self {
        Self::default()
    }

    /// Registry with the built-in `echo`, `static` and `cgi` handlers
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        crate::handlers::register_builtins(&mut registry);
        registry
    }

    /// Register (or replace) a handler kind
    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&LoadContext<'_>) -> anyhow::Result<Arc<dyn Application>> + Send + Sync + 'static,
    {
        self.handlers.insert(name.to_string(), Arc::new(factory));
    }

    pub fn has_handler(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Read the manifest and instantiate the selected binding.
    pub fn load(&self, descriptor: &AppDescriptor) -> Result<LoadedApp, LoadError> {
        let path = &descriptor.file;
        let content = std::fs::read_to_string(path).map_err(|source| LoadError::Read {
            path: path.clone(),
            source,
        })?;
        let manifest: Table = toml::from_str(&content).map_err(|source| LoadError::Parse {
            path: path.clone(),
            source,
        })?;

        let settings = manifest
            .get(&descriptor.binding)
            .and_then(Value::as_table)
            .ok_or_else(|| LoadError::MissingBinding {
                path: path.clone(),
                name: descriptor.binding.clone(),
            })?;

        let handler = settings
            .get("handler")
            .and_then(Value::as_str)
            .ok_or_else(|| LoadError::MissingHandler {
                path: path.clone(),
                name: descriptor.binding.clone(),
            })?;

        let factory = self
            .handlers
            .get(handler)
            .ok_or_else(|| LoadError::UnknownHandler(handler.to_string()))?;

        let ctx = LoadContext {
            service: &descriptor.service,
            source_file: path,
            binding: &descriptor.binding,
            settings,
            args: if descriptor.factory {
                descriptor.args.as_ref()
            } else {
                None
            },
            search_path: &descriptor.search_path,
            env: &descriptor.env,
        };

        let app = factory(&ctx).map_err(|e| LoadError::Init {
            handler: handler.to_string(),
            message: format!("{:#}", e),
        })?;

        Ok(LoadedApp {
            handler: handler.to_string(),
            binding: descriptor.binding.clone(),
            app,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;

    struct Fixed(&'static str);

    impl Application for Fixed {
        fn call(&self, _request: Request<Bytes>) -> AppFuture {
            let body = self.0;
            async move { Ok(Response::new(Bytes::from(body))) }.boxed()
        }
    }

    fn registry() -> ApplicationRegistry {
        let mut registry = ApplicationRegistry::empty();
        registry.register("fixed", |ctx| {
            let text = match ctx.get_str("text") {
                Some("alt") => "alt",
                _ => "default",
            };
            Ok(Arc::new(Fixed(text)) as Arc<dyn Application>)
        });
        registry.register("broken", |_ctx| anyhow::bail!("cannot start"));
        registry
    }

    fn manifest(dir: &Path, text: &str) -> PathBuf {
        let path = dir.join("app.toml");
        std::fs::write(&path, text).unwrap();
        path
    }

    fn descriptor(file: PathBuf) -> AppDescriptor {
        AppDescriptor::from(&ServiceConfig::new("svc", file))
    }

    #[tokio::test]
    async fn test_load_default_entry_point() {
        let dir = tempfile::tempdir().unwrap();
        let file = manifest(dir.path(), "[application]\nhandler = \"fixed\"\n");

        let loaded = registry().load(&descriptor(file)).unwrap();
        assert_eq!(loaded.handler, "fixed");
        assert_eq!(loaded.binding, "application");

        let response = loaded.app.call(Request::new(Bytes::new())).await.unwrap();
        assert_eq!(response.body(), &Bytes::from("default"));
    }

    #[tokio::test]
    async fn test_factory_receives_args() {
        let dir = tempfile::tempdir().unwrap();
        let file = manifest(
            dir.path(),
            "[make]\nhandler = \"fixed\"\ntext = \"ignored\"\n",
        );

        let mut config = ServiceConfig::new("svc", file);
        config.create = Some("make".to_string());
        config.args = Some(toml::from_str::<Value>("text = \"alt\"").unwrap());

        let loaded = registry().load(&AppDescriptor::from(&config)).unwrap();
        assert_eq!(loaded.binding, "make");
        let response = loaded.app.call(Request::new(Bytes::new())).await.unwrap();
        assert_eq!(response.body(), &Bytes::from("alt"));
    }

    #[test]
    fn test_args_ignored_without_factory() {
        let settings: Table = toml::from_str("text = \"own\"").unwrap();
        let args: Value = toml::from_str("text = \"arg\"").unwrap();
        let env = HashMap::new();
        let ctx = LoadContext {
            service: "svc",
            source_file: Path::new("/apps/app.toml"),
            binding: "application",
            settings: &settings,
            args: Some(&args),
            search_path: &[],
            env: &env,
        };
        assert_eq!(ctx.get_str("text"), Some("arg"));
        assert_eq!(ctx.resolve("public"), PathBuf::from("/apps/public"));
        assert_eq!(ctx.resolve("/srv"), PathBuf::from("/srv"));
    }

    #[test]
    fn test_missing_binding() {
        let dir = tempfile::tempdir().unwrap();
        let file = manifest(dir.path(), "[other]\nhandler = \"fixed\"\n");

        let err = registry().load(&descriptor(file)).unwrap_err();
        assert!(matches!(err, LoadError::MissingBinding { ref name, .. } if name == "application"));
    }

    #[test]
    fn test_missing_file_and_bad_syntax() {
        let dir = tempfile::tempdir().unwrap();
        let err = registry()
            .load(&descriptor(dir.path().join("nope.toml")))
            .unwrap_err();
        assert!(matches!(err, LoadError::Read { .. }));

        let file = manifest(dir.path(), "[application\n");
        let err = registry().load(&descriptor(file)).unwrap_err();
        assert!(matches!(err, LoadError::Parse { .. }));
    }

    #[test]
    fn test_unknown_and_failing_handlers() {
        let dir = tempfile::tempdir().unwrap();
        let file = manifest(dir.path(), "[application]\nhandler = \"wat\"\n");
        let err = registry().load(&descriptor(file)).unwrap_err();
        assert!(matches!(err, LoadError::UnknownHandler(ref h) if h == "wat"));

        let file = manifest(dir.path(), "[application]\nhandler = \"broken\"\n");
        let err = registry().load(&descriptor(file)).unwrap_err();
        assert!(err.to_string().contains("cannot start"));

        let file = manifest(dir.path(), "[application]\nroot = \"x\"\n");
        let err = registry().load(&descriptor(file)).unwrap_err();
        assert!(matches!(err, LoadError::MissingHandler { .. }));
    }

    #[test]
    fn test_builtins_registered() {
        let registry = ApplicationRegistry::with_builtins();
        assert!(registry.has_handler("echo"));
        assert!(registry.has_handler("static"));
        assert!(registry.has_handler("cgi"));
    }
}
