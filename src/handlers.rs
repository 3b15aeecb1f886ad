//! Built-in application handlers
//!
//! - `echo`: answers with a JSON description of the request it received
//! - `static`: serves files below a root directory
//! - `cgi`: runs an external program per request using the CGI/1.1 conventions

use crate::app::{AppFuture, Application, ApplicationRegistry, LoadContext, ServiceTag};
use anyhow::{anyhow, bail, Context};
use futures::FutureExt;
use hyper::body::Bytes;
use hyper::{header, Method, Request, Response, StatusCode};
use std::collections::HashMap;
use std::ffi::OsString;
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

pub fn register_builtins(registry: &mut ApplicationRegistry) {
    registry.register("echo", |ctx| Ok(Arc::new(Echo::from_context(ctx)) as Arc<dyn Application>));
    registry.register("static", |ctx| {
        Ok(Arc::new(StaticFiles::from_context(ctx)?) as Arc<dyn Application>)
    });
    registry.register("cgi", |ctx| Ok(Arc::new(Cgi::from_context(ctx)?) as Arc<dyn Application>));
}

fn service_of(request: &Request<Bytes>) -> String {
    request
        .extensions()
        .get::<ServiceTag>()
        .map(|tag| tag.0.clone())
        .unwrap_or_default()
}

fn text_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Bytes> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(body.into())
        .expect("valid response with StatusCode enum and static headers")
}

// ---------------------------------------------------------------------------
// echo
// ---------------------------------------------------------------------------

struct Echo {
    greeting: String,
}

impl Echo {
    fn from_context(ctx: &LoadContext<'_>) -> Self {
        Self {
            greeting: ctx.get_str("greeting").unwrap_or("hello").to_string(),
        }
    }
}

impl Application for Echo {
    fn call(&self, request: Request<Bytes>) -> AppFuture {
        let payload = serde_json::json!({
            "greeting": self.greeting,
            "service": service_of(&request),
            "method": request.method().as_str(),
            "uri": request.uri().to_string(),
            "body": String::from_utf8_lossy(request.body()),
        });
        let response = Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Bytes::from(payload.to_string()))
            .map_err(anyhow::Error::from);
        futures::future::ready(response).boxed()
    }
}

// ---------------------------------------------------------------------------
// static
// ---------------------------------------------------------------------------

struct StaticFiles {
    root: PathBuf,
    index: String,
}

impl StaticFiles {
    fn from_context(ctx: &LoadContext<'_>) -> anyhow::Result<Self> {
        let root = ctx
            .get_str("root")
            .ok_or_else(|| anyhow!("static handler requires a 'root' setting"))?;
        let root = ctx.resolve(root);
        if !root.is_dir() {
            bail!("static root {} is not a directory", root.display());
        }
        Ok(Self {
            root,
            index: ctx.get_str("index").unwrap_or("index.html").to_string(),
        })
    }

    /// Map a request path onto the root, refusing anything that climbs out of it
    fn locate(&self, request_path: &str) -> Option<PathBuf> {
        let mut relative = request_path.trim_start_matches('/').to_string();
        if relative.is_empty() || relative.ends_with('/') {
            relative.push_str(&self.index);
        }

        let relative = Path::new(&relative);
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return None;
        }
        Some(self.root.join(relative))
    }
}

fn content_type_for(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("html") | Some("htm") => "text/html; charset=utf-8",
        Some("css") => "text/css",
        Some("js") => "application/javascript",
        Some("json") => "application/json",
        Some("txt") => "text/plain; charset=utf-8",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("svg") => "image/svg+xml",
        _ => "application/octet-stream",
    }
}

impl Application for StaticFiles {
    fn call(&self, request: Request<Bytes>) -> AppFuture {
        let method = request.method().clone();
        let located = self.locate(request.uri().path());
        serve_file(method, located).boxed()
    }
}

async fn serve_file(method: Method, located: Option<PathBuf>) -> anyhow::Result<Response<Bytes>> {
    if method != Method::GET && method != Method::HEAD {
        return Ok(text_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed\n"));
    }
    let Some(path) = located else {
        return Ok(text_response(StatusCode::FORBIDDEN, "forbidden\n"));
    };

    match tokio::fs::read(&path).await {
        Ok(contents) => {
            let body = if method == Method::HEAD {
                Bytes::new()
            } else {
                Bytes::from(contents)
            };
            Ok(Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, content_type_for(&path))
                .body(body)?)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Ok(text_response(StatusCode::NOT_FOUND, "not found\n"))
        }
        Err(e) => Err(e).with_context(|| format!("failed to read {}", path.display())),
    }
}

// ---------------------------------------------------------------------------
// cgi
// ---------------------------------------------------------------------------

struct Cgi {
    program: PathBuf,
    args: Vec<String>,
    working_dir: PathBuf,
    env: HashMap<String, String>,
    path_env: OsString,
}

impl Cgi {
    fn from_context(ctx: &LoadContext<'_>) -> anyhow::Result<Self> {
        let program = ctx
            .get_str("program")
            .ok_or_else(|| anyhow!("cgi handler requires a 'program' setting"))?;

        // Configured directories first, then the PATH this process inherited.
        let inherited = std::env::var_os("PATH").unwrap_or_default();
        let mut dirs: Vec<PathBuf> = ctx.search_path.iter().map(|p| ctx.resolve(p)).collect();
        dirs.extend(std::env::split_paths(&inherited));

        let program = resolve_program(program, ctx.base_dir(), &dirs)?;
        let path_env = std::env::join_paths(&dirs).context("search path is not representable")?;

        Ok(Self {
            program,
            args: parse_args(ctx.get("args"))?,
            working_dir: ctx.base_dir().to_path_buf(),
            env: ctx.env.clone(),
            path_env,
        })
    }
}

fn parse_args(value: Option<&toml::Value>) -> anyhow::Result<Vec<String>> {
    match value {
        None => Ok(Vec::new()),
        Some(toml::Value::String(line)) => {
            shell_words::split(line).with_context(|| format!("cannot split arguments '{}'", line))
        }
        Some(toml::Value::Array(items)) => items
            .iter()
            .map(|item| {
                item.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| anyhow!("cgi arguments must be strings"))
            })
            .collect(),
        Some(_) => bail!("cgi 'args' must be a string or an array of strings"),
    }
}

/// Find the program: paths with a separator are relative to `base_dir`,
/// bare names are looked up in `dirs` in order.
fn resolve_program(program: &str, base_dir: &Path, dirs: &[PathBuf]) -> anyhow::Result<PathBuf> {
    if program.contains('/') {
        let path = Path::new(program);
        let path = if path.is_absolute() {
            path.to_path_buf()
        } else {
            base_dir.join(path)
        };
        if path.is_file() {
            return Ok(path);
        }
        bail!("cgi program {} does not exist", path.display());
    }

    dirs.iter()
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
        .ok_or_else(|| anyhow!("cgi program '{}' not found on the search path", program))
}

fn cgi_env(request: &Request<Bytes>) -> Vec<(String, String)> {
    let mut vars = vec![
        ("GATEWAY_INTERFACE".to_string(), "CGI/1.1".to_string()),
        (
            "SERVER_SOFTWARE".to_string(),
            format!("multiserver/{}", env!("CARGO_PKG_VERSION")),
        ),
        ("SERVER_PROTOCOL".to_string(), format!("{:?}", request.version())),
        ("REQUEST_METHOD".to_string(), request.method().to_string()),
        ("PATH_INFO".to_string(), request.uri().path().to_string()),
        (
            "QUERY_STRING".to_string(),
            request.uri().query().unwrap_or("").to_string(),
        ),
        ("CONTENT_LENGTH".to_string(), request.body().len().to_string()),
        ("MULTISERVER_SERVICE".to_string(), service_of(request)),
    ];

    for (name, value) in request.headers() {
        let Ok(value) = value.to_str() else { continue };
        if name == header::CONTENT_TYPE {
            vars.push(("CONTENT_TYPE".to_string(), value.to_string()));
            continue;
        }
        let key = format!("HTTP_{}", name.as_str().to_ascii_uppercase().replace('-', "_"));
        vars.push((key, value.to_string()));
    }
    vars
}

impl Application for Cgi {
    fn call(&self, request: Request<Bytes>) -> AppFuture {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.args)
            .current_dir(&self.working_dir)
            .env("PATH", &self.path_env)
            .envs(&self.env)
            .envs(cgi_env(&request))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        run_cgi(cmd, self.program.clone(), request.into_body()).boxed()
    }
}

async fn run_cgi(
    mut cmd: tokio::process::Command,
    program: PathBuf,
    body: Bytes,
) -> anyhow::Result<Response<Bytes>> {
    let mut child = cmd
        .spawn()
        .with_context(|| format!("failed to start {}", program.display()))?;

    if let Some(mut stdin) = child.stdin.take() {
        tokio::spawn(async move {
            // The program may exit without reading its input.
            let _ = stdin.write_all(&body).await;
        });
    }

    let output = child.wait_with_output().await?;
    let stderr = String::from_utf8_lossy(&output.stderr);
    if !output.status.success() {
        bail!("{} exited with {}: {}", program.display(), output.status, stderr.trim());
    }
    if !stderr.trim().is_empty() {
        warn!(program = %program.display(), stderr = %stderr.trim(), "CGI program wrote to stderr");
    }

    debug!(program = %program.display(), bytes = output.stdout.len(), "CGI program finished");
    parse_cgi_output(&output.stdout)
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Split CGI output into the header block and the body
fn split_head(raw: &[u8]) -> Option<(&[u8], &[u8])> {
    let crlf = find(raw, b"\r\n\r\n").map(|i| (i, 4));
    let lf = find(raw, b"\n\n").map(|i| (i, 2));
    let (at, len) = match (crlf, lf) {
        (Some(a), Some(b)) => {
            if a.0 <= b.0 {
                a
            } else {
                b
            }
        }
        (a, b) => a.or(b)?,
    };
    Some((&raw[..at], &raw[at + len..]))
}

fn parse_cgi_output(raw: &[u8]) -> anyhow::Result<Response<Bytes>> {
    let (head, body) = split_head(raw).ok_or_else(|| anyhow!("CGI output has no header block"))?;
    let head = std::str::from_utf8(head).context("CGI headers are not valid UTF-8")?;

    let mut status = StatusCode::OK;
    let mut builder = Response::builder();
    for line in head.lines() {
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            continue;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| anyhow!("malformed CGI header line '{}'", line))?;
        let (name, value) = (name.trim(), value.trim());

        if name.eq_ignore_ascii_case("status") {
            let code = value.split_whitespace().next().unwrap_or_default();
            status = StatusCode::from_bytes(code.as_bytes())
                .with_context(|| format!("invalid CGI status '{}'", value))?;
        } else {
            builder = builder.header(name, value);
        }
    }

    Ok(builder.status(status).body(Bytes::copy_from_slice(body))?)
}
