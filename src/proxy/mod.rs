//! Reverse-proxy route publishing.
//!
//! Each live container gets one nginx fragment in the proxy's `conf.d`
//! directory, named after its route. Writing or deleting a fragment does not
//! activate anything on its own; [`RoutePublisher::reload`] asks the
//! [`ReloadCoalescer`] for a debounced reload.
//!
//! ```text
//!   publish(route, port) ──▶ conf.d/<route>.conf ─┐
//!   unpublish(route)     ──▶ rm <route>.conf     ─┤
//!                                                 ▼
//!   reload() ──▶ ReloadCoalescer ──(1 per window)──▶ nginx -s reload
//! ```

mod coalesce;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::ProxyError;

pub use coalesce::{DEFAULT_DEBOUNCE, PendingReload, ReloadCoalescer, ReloadOutcome};

/// Something that makes the proxy re-read its configuration.
#[async_trait]
pub trait ProxyReloader: Send + Sync {
    async fn reload(&self) -> Result<(), ProxyError>;
}

/// Runs an external command (by default `nginx -s reload`).
#[derive(Debug, Clone)]
pub struct CommandReloader {
    program: String,
    args: Vec<String>,
}

impl CommandReloader {
    pub fn nginx() -> Self {
        Self {
            program: "nginx".to_string(),
            args: vec!["-s".to_string(), "reload".to_string()],
        }
    }

    /// Split a command line on whitespace. Returns `None` for a blank line.
    pub fn from_command_line(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self {
            program,
            args: parts.collect(),
        })
    }

    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[async_trait]
impl ProxyReloader for CommandReloader {
    async fn reload(&self) -> Result<(), ProxyError> {
        let output = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .output()
            .await
            .map_err(|e| ProxyError::ReloadFailed {
                reason: format!("failed to run `{}`: {}", self.command_line(), e),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ProxyError::ReloadFailed {
                reason: format!(
                    "`{}` exited with {}: {}",
                    self.command_line(),
                    output.status,
                    stderr.trim()
                ),
            });
        }
        Ok(())
    }
}

/// nginx `location` block forwarding `/<route>` to the container, with
/// upgrade headers preserved for websocket traffic.
pub fn render_fragment(route: &str, upstream_host: &str, port: u16) -> String {
    format!(
        r#"location /{route} {{
    proxy_pass http://{upstream_host}:{port};
    proxy_http_version 1.1;
    proxy_set_header Upgrade $http_upgrade;
    proxy_set_header Connection "upgrade";
    proxy_set_header Host $host;
    proxy_cache_bypass $http_upgrade;
}}
"#
    )
}

/// Keeps the proxy's routing table in step with live containers.
pub struct RoutePublisher {
    conf_dir: PathBuf,
    upstream_host: String,
    coalescer: ReloadCoalescer,
}

impl RoutePublisher {
    pub fn new(
        conf_dir: impl Into<PathBuf>,
        upstream_host: impl Into<String>,
        debounce: Duration,
        reloader: Arc<dyn ProxyReloader>,
    ) -> Self {
        Self {
            conf_dir: conf_dir.into(),
            upstream_host: upstream_host.into(),
            coalescer: ReloadCoalescer::new(debounce, reloader),
        }
    }

    pub fn conf_dir(&self) -> &Path {
        &self.conf_dir
    }

    /// Where the fragment for `route` lives.
    pub fn fragment_path(&self, route: &str) -> PathBuf {
        self.conf_dir.join(format!("{}.conf", route))
    }

    /// Write (or overwrite) the fragment for `route`.
    ///
    /// The file is written under a name nginx does not include and then
    /// renamed into place, so a concurrent reload never sees half a block.
    pub async fn publish(&self, route: &str, port: u16) -> Result<(), ProxyError> {
        let body = render_fragment(route, &self.upstream_host, port);
        let tmp = self.conf_dir.join(format!(".{}.conf.tmp", route));
        let path = self.fragment_path(route);

        let write_err = |source| ProxyError::Write {
            route: route.to_string(),
            source,
        };
        tokio::fs::write(&tmp, body).await.map_err(write_err)?;
        tokio::fs::rename(&tmp, &path).await.map_err(write_err)?;

        tracing::debug!(route, port, path = %path.display(), "Published route fragment");
        Ok(())
    }

    /// Delete the fragment for `route`. A missing file is fine.
    pub async fn unpublish(&self, route: &str) -> Result<(), ProxyError> {
        let path = self.fragment_path(route);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                tracing::debug!(route, path = %path.display(), "Removed route fragment");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(ProxyError::Remove {
                route: route.to_string(),
                source,
            }),
        }
    }

    /// Whether a fragment for `route` is on disk.
    pub async fn is_published(&self, route: &str) -> bool {
        tokio::fs::try_exists(self.fragment_path(route))
            .await
            .unwrap_or(false)
    }

    /// Request a coalesced reload; see [`ReloadCoalescer::reload`].
    pub fn reload(&self) -> PendingReload {
        self.coalescer.reload()
    }

    /// Number of reload signals sent so far.
    pub fn reload_generation(&self) -> u64 {
        self.coalescer.generation()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ReloadOutcome> {
        self.coalescer.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};

    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[derive(Default)]
    struct NoopReloader(AtomicUsize);

    #[async_trait]
    impl ProxyReloader for NoopReloader {
        async fn reload(&self) -> Result<(), ProxyError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn publisher(dir: &TempDir) -> (RoutePublisher, Arc<NoopReloader>) {
        let reloader = Arc::new(NoopReloader::default());
        let publisher = RoutePublisher::new(
            dir.path(),
            "host.docker.internal",
            Duration::from_millis(20),
            reloader.clone(),
        );
        (publisher, reloader)
    }

    #[test]
    fn test_render_fragment() {
        let expected = r#"location /brave-otter-k3x9q {
    proxy_pass http://host.docker.internal:49153;
    proxy_http_version 1.1;
    proxy_set_header Upgrade $http_upgrade;
    proxy_set_header Connection "upgrade";
    proxy_set_header Host $host;
    proxy_cache_bypass $http_upgrade;
}
"#;
        assert_eq!(
            render_fragment("brave-otter-k3x9q", "host.docker.internal", 49153),
            expected
        );
    }

    #[tokio::test]
    async fn test_publish_writes_named_fragment() {
        let dir = TempDir::new().unwrap();
        let (publisher, _) = publisher(&dir);

        publisher.publish("room-a", 49200).await.unwrap();

        let path = dir.path().join("room-a.conf");
        let body = std::fs::read_to_string(&path).unwrap();
        assert!(body.contains("location /room-a {"));
        assert!(body.contains("proxy_pass http://host.docker.internal:49200;"));
        assert!(publisher.is_published("room-a").await);
        assert!(!dir.path().join(".room-a.conf.tmp").exists());
    }

    #[tokio::test]
    async fn test_publish_overwrites() {
        let dir = TempDir::new().unwrap();
        let (publisher, _) = publisher(&dir);

        publisher.publish("room-a", 1111).await.unwrap();
        publisher.publish("room-a", 2222).await.unwrap();

        let body = std::fs::read_to_string(dir.path().join("room-a.conf")).unwrap();
        assert!(body.contains(":2222;"));
        assert!(!body.contains(":1111;"));
    }

    #[tokio::test]
    async fn test_unpublish_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let (publisher, _) = publisher(&dir);

        publisher.publish("room-a", 1111).await.unwrap();
        publisher.unpublish("room-a").await.unwrap();
        assert!(!publisher.is_published("room-a").await);
        publisher.unpublish("room-a").await.unwrap();
    }

    #[tokio::test]
    async fn test_publish_into_missing_dir_fails() {
        let dir = TempDir::new().unwrap();
        let reloader = Arc::new(NoopReloader::default());
        let publisher = RoutePublisher::new(
            dir.path().join("missing"),
            "localhost",
            Duration::from_millis(20),
            reloader,
        );
        let err = publisher.publish("room-a", 1).await.unwrap_err();
        assert!(matches!(err, ProxyError::Write { ref route, .. } if route == "room-a"));
    }

    #[tokio::test]
    async fn test_publish_then_reload_signals_once() {
        let dir = TempDir::new().unwrap();
        let (publisher, reloader) = publisher(&dir);

        publisher.publish("a", 1).await.unwrap();
        let first = publisher.reload();
        publisher.publish("b", 2).await.unwrap();
        let second = publisher.reload();

        first.await;
        second.await;
        assert_eq!(reloader.0.load(Ordering::SeqCst), 1);
        assert_eq!(publisher.reload_generation(), 1);
    }

    #[test]
    fn test_command_line_parsing() {
        let reloader = CommandReloader::from_command_line("  docker exec proxy nginx -s reload ")
            .unwrap();
        assert_eq!(reloader.command_line(), "docker exec proxy nginx -s reload");
        assert!(CommandReloader::from_command_line("   ").is_none());
        assert_eq!(CommandReloader::nginx().command_line(), "nginx -s reload");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_reloader_exit_status() {
        let ok = CommandReloader::from_command_line("true").unwrap();
        assert!(ok.reload().await.is_ok());

        let failing = CommandReloader::from_command_line("false").unwrap();
        let err = failing.reload().await.unwrap_err();
        assert!(err.to_string().contains("`false` exited with"));

        let missing = CommandReloader::from_command_line("definitely-not-a-binary-xyz").unwrap();
        let err = missing.reload().await.unwrap_err();
        assert!(err.to_string().contains("failed to run"));
    }
}
