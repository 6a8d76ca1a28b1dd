use crate::{Error, ErrorKind, RenderOptions, RenderResult, Renderer, Result, StatsSnapshot};
use log::debug;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread;
use std::time::Duration;
use tokio::sync::oneshot;

enum Command {
    Render(String, RenderOptions, oneshot::Sender<RenderResult>),
    Stats(oneshot::Sender<StatsSnapshot>),
    Shutdown(oneshot::Sender<()>),
}

/// An async-friendly renderer backed by a dedicated worker thread.
///
/// The worker thread owns a blocking [`Renderer`] and executes commands sent
/// from async tasks, so async callers reuse the same long-lived engine
/// instead of launching one per call. Renders are processed one at a time in
/// the order they were sent.
#[derive(Clone)]
pub struct AsyncRenderer {
    cmd_tx: Sender<Command>,
    name: &'static str,
}

fn run_worker(mut renderer: Box<dyn Renderer>, cmd_rx: Receiver<Command>) {
    while let Ok(cmd) = cmd_rx.recv() {
        match cmd {
            Command::Render(url, options, resp) => {
                let _ = resp.send(renderer.render(&url, &options));
            }
            Command::Stats(resp) => {
                let _ = resp.send(renderer.stats());
            }
            Command::Shutdown(resp) => {
                renderer.shutdown();
                let _ = resp.send(());
                return;
            }
        }
    }
    // Every handle was dropped without an explicit shutdown
    debug!("All {} handles dropped, shutting down worker", renderer.name());
    renderer.shutdown();
}

impl AsyncRenderer {
    /// Move an already constructed renderer onto a worker thread.
    pub fn spawn(renderer: Box<dyn Renderer + Send>) -> Result<Self> {
        let name = renderer.name();
        let (cmd_tx, cmd_rx) = mpsc::channel::<Command>();
        thread::Builder::new()
            .name(format!("crawlrender-{}", name.to_ascii_lowercase()))
            .spawn(move || run_worker(renderer, cmd_rx))
            .map_err(|e| Error::Configuration(format!("Failed to spawn worker thread: {}", e)))?;
        Ok(Self { cmd_tx, name })
    }

    /// Construct the renderer on the worker thread itself.
    ///
    /// Use this for renderers that are not `Send`, or that must not be built
    /// inside the caller's async runtime (an owned devtools event loop).
    pub async fn launch<F>(build: F) -> Result<Self>
    where
        F: FnOnce() -> Result<Box<dyn Renderer>> + Send + 'static,
    {
        let (cmd_tx, cmd_rx) = mpsc::channel::<Command>();
        let (init_tx, init_rx) = oneshot::channel::<Result<&'static str>>();

        thread::Builder::new()
            .name("crawlrender-worker".to_string())
            .spawn(move || {
                let renderer = match build() {
                    Ok(r) => r,
                    Err(err) => {
                        let _ = init_tx.send(Err(err));
                        return;
                    }
                };
                let _ = init_tx.send(Ok(renderer.name()));
                run_worker(renderer, cmd_rx);
            })
            .map_err(|e| Error::Configuration(format!("Failed to spawn worker thread: {}", e)))?;

        let name = init_rx
            .await
            .map_err(|e| Error::Configuration(format!("Worker init canceled: {}", e)))??;

        Ok(Self { cmd_tx, name })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Render on the worker thread. Never fails; a stopped worker yields a
    /// failed result.
    pub async fn render(&self, url: &str, options: RenderOptions) -> RenderResult {
        let (tx, rx) = oneshot::channel();
        let stopped = || {
            let err = Error::Configuration(format!("{} renderer has been shut down", self.name));
            RenderResult::failure(url, Duration::ZERO, err.render_message(self.name, url), ErrorKind::Configuration)
        };
        if self
            .cmd_tx
            .send(Command::Render(url.to_string(), options, tx))
            .is_err()
        {
            return stopped();
        }
        rx.await.unwrap_or_else(|_| stopped())
    }

    pub async fn stats(&self) -> Result<StatsSnapshot> {
        let (tx, rx) = oneshot::channel();
        let _ = self.cmd_tx.send(Command::Stats(tx));
        rx.await
            .map_err(|e| Error::Configuration(format!("Stats canceled: {}", e)))
    }

    /// Shut down the renderer and stop the worker. Later calls are no-ops.
    pub async fn shutdown(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Shutdown(tx)).is_err() {
            return Ok(());
        }
        // A closed channel means another handle shut the worker down first
        let _ = rx.await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{PageCapture, RenderStats};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Instant;

    struct EchoRenderer {
        stats: RenderStats,
        shutdowns: Arc<AtomicUsize>,
    }

    impl Renderer for EchoRenderer {
        fn name(&self) -> &'static str {
            "Echo"
        }

        fn render(&self, url: &str, options: &RenderOptions) -> RenderResult {
            let outcome = if url.starts_with("http") {
                Ok(PageCapture {
                    html: format!("<p>{}</p>", options.user_agent.as_deref().unwrap_or("none")),
                    status_code: 200,
                    url: url.to_string(),
                    ..Default::default()
                })
            } else {
                Err(Error::Navigation("unsupported scheme".into()))
            };
            crate::conclude(&self.stats, Instant::now(), "Echo", url, outcome)
        }

        fn shutdown(&mut self) {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
        }

        fn stats(&self) -> StatsSnapshot {
            self.stats.snapshot()
        }
    }

    fn echo(shutdowns: &Arc<AtomicUsize>) -> EchoRenderer {
        EchoRenderer {
            stats: RenderStats::new(),
            shutdowns: Arc::clone(shutdowns),
        }
    }

    #[tokio::test]
    async fn renders_reuse_one_engine() {
        let shutdowns = Arc::new(AtomicUsize::new(0));
        let renderer = AsyncRenderer::spawn(Box::new(echo(&shutdowns))).unwrap();

        let options = RenderOptions {
            user_agent: Some("ua-1".into()),
            ..Default::default()
        };
        let ok = renderer.render("https://example.com", options).await;
        assert!(ok.is_success());
        assert_eq!(ok.html, "<p>ua-1</p>");

        let failed = renderer.render("ftp://example.com", RenderOptions::default()).await;
        assert!(!failed.is_success());

        let stats = renderer.stats().await.unwrap();
        assert_eq!(stats.pages_rendered, 2);
        assert_eq!(stats.successful_renders, 1);

        renderer.shutdown().await.unwrap();
        renderer.shutdown().await.unwrap();
        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);

        let after = renderer.render("https://example.com", RenderOptions::default()).await;
        assert!(after.error.unwrap().contains("shut down"));
    }

    #[tokio::test]
    async fn launch_reports_build_errors() {
        let err = AsyncRenderer::launch(|| Err(Error::Configuration("no engine".into())))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::Configuration(_)));

        let shutdowns = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&shutdowns);
        let renderer = AsyncRenderer::launch(move || Ok(Box::new(echo(&counter)) as Box<dyn Renderer>))
            .await
            .unwrap();
        assert_eq!(renderer.name(), "Echo");
        drop(renderer);
        // Dropping the last handle shuts the worker down
        for _ in 0..50 {
            if shutdowns.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
    }
}
