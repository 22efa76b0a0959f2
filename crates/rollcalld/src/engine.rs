use std::path::{Path, PathBuf};
use std::time::Instant;

use rollcall_core::{AnalyzerError, FaceAnalyzer, FaceScan};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("analyzer error: {0}")]
    Analyzer(#[from] AnalyzerError),
    #[error("could not read staged upload: {0}")]
    Io(#[from] std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Boxed analyzer owned by the engine thread.
pub type BoxedAnalyzer = Box<dyn FaceAnalyzer + Send>;

/// Messages sent from HTTP handlers to the engine thread.
enum EngineRequest {
    Analyze {
        path: PathBuf,
        reply: oneshot::Sender<Result<FaceScan, EngineError>>,
    },
    Load {
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    Status {
        reply: oneshot::Sender<bool>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    /// Run face analysis on a staged image file.
    pub async fn analyze(&self, path: PathBuf) -> Result<FaceScan, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(EngineRequest::Analyze {
            path,
            reply: reply_tx,
        })
        .await?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Load the models now instead of on the first analysis.
    pub async fn preload(&self) -> Result<(), EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(EngineRequest::Load { reply: reply_tx }).await?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Whether the models have been loaded.
    pub async fn models_loaded(&self) -> Result<bool, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(EngineRequest::Status { reply: reply_tx }).await?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)
    }

    async fn send(&self, req: EngineRequest) -> Result<(), EngineError> {
        self.tx
            .send(req)
            .await
            .map_err(|_| EngineError::ChannelClosed)
    }
}

/// Analyzer slot with load-on-first-use. A failed load leaves the slot
/// empty so the next request tries again.
struct Engine<L> {
    loader: L,
    analyzer: Option<BoxedAnalyzer>,
}

impl<L> Engine<L>
where
    L: FnMut() -> Result<BoxedAnalyzer, AnalyzerError>,
{
    fn ensure_loaded(&mut self) -> Result<&mut BoxedAnalyzer, AnalyzerError> {
        let analyzer = match &mut self.analyzer {
            Some(analyzer) => analyzer,
            slot => {
                let started = Instant::now();
                let loaded = (self.loader)()?;
                tracing::info!(
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "face models loaded"
                );
                slot.insert(loaded)
            }
        };
        Ok(analyzer)
    }

    fn analyze(&mut self, path: &Path) -> Result<FaceScan, EngineError> {
        let image = std::fs::read(path)?;
        let analyzer = self.ensure_loaded()?;
        let started = Instant::now();
        let scan = analyzer.analyze(&image)?;
        tracing::debug!(
            faces = scan.face_count(),
            bytes = image.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "analyze: done"
        );
        Ok(scan)
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// The thread owns the analyzer, so every analysis runs sequentially no
/// matter how many requests are in flight. Models are loaded through
/// `loader` on first use.
pub fn spawn_engine<L>(loader: L) -> Result<EngineHandle, EngineError>
where
    L: FnMut() -> Result<BoxedAnalyzer, AnalyzerError> + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(16);
    let mut engine = Engine {
        loader,
        analyzer: None,
    };

    std::thread::Builder::new()
        .name("rollcall-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Analyze { path, reply } => {
                        let result = engine.analyze(&path);
                        if let Err(err) = &result {
                            tracing::warn!(error = %err, "analyze failed");
                        }
                        let _ = reply.send(result);
                    }
                    EngineRequest::Load { reply } => {
                        let result = engine
                            .ensure_loaded()
                            .map(|_| ())
                            .map_err(EngineError::from);
                        let _ = reply.send(result);
                    }
                    EngineRequest::Status { reply } => {
                        let _ = reply.send(engine.analyzer.is_some());
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })?;

    Ok(EngineHandle { tx })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{face_image, StubAnalyzer};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counting_engine(fail_first: bool) -> (EngineHandle, Arc<AtomicUsize>) {
        let loads = Arc::new(AtomicUsize::new(0));
        let counter = loads.clone();
        let handle = spawn_engine(move || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            if fail_first && n == 0 {
                return Err(AnalyzerError::ModelNotFound("det_10g.onnx".into()));
            }
            Ok(Box::new(StubAnalyzer) as BoxedAnalyzer)
        })
        .unwrap();
        (handle, loads)
    }

    fn staged(bytes: &[u8]) -> tempfile::NamedTempFile {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), bytes).unwrap();
        file
    }

    #[tokio::test]
    async fn test_models_load_lazily_once() {
        let (engine, loads) = counting_engine(false);
        assert!(!engine.models_loaded().await.unwrap());
        assert_eq!(loads.load(Ordering::SeqCst), 0);

        let image = staged(&face_image(&[&[0.1, 0.2, 0.3]]));
        match engine.analyze(image.path().to_path_buf()).await.unwrap() {
            FaceScan::Single(face) => assert_eq!(face.embedding.values, vec![0.1, 0.2, 0.3]),
            other => panic!("expected one face, got {other:?}"),
        }

        engine.analyze(image.path().to_path_buf()).await.unwrap();
        assert!(engine.models_loaded().await.unwrap());
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_load_is_retried() {
        let (engine, loads) = counting_engine(true);
        let image = staged(&face_image(&[&[0.0, 0.0, 1.0]]));

        let err = engine.analyze(image.path().to_path_buf()).await.unwrap_err();
        assert!(matches!(err, EngineError::Analyzer(AnalyzerError::ModelNotFound(_))));
        assert!(!engine.models_loaded().await.unwrap());

        engine.analyze(image.path().to_path_buf()).await.unwrap();
        assert_eq!(loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_preload() {
        let (engine, loads) = counting_engine(false);
        engine.preload().await.unwrap();
        engine.preload().await.unwrap();
        assert!(engine.models_loaded().await.unwrap());
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_missing_upload_is_io_error() {
        let (engine, _) = counting_engine(false);
        let err = engine
            .analyze(PathBuf::from("/nonexistent/upload.jpg"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Io(_)));
    }
}
