//! Prometheus metrics exporter.

use std::net::SocketAddr;
use std::sync::Arc;

use prometheus::{CounterVec, Gauge, Histogram, HistogramOpts, Opts, Registry};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::controller::events::{EventKind, ProgressEvent};
use crate::coordinator::CoordinatorState;
use crate::error::NotificationError;
use crate::planner::UnitStatus;

/// Prometheus metrics for the conversion engine.
pub struct Metrics {
    /// Registry for all metrics.
    registry: Registry,
    /// Finished unit attempts by resulting status.
    pub units_total: CounterVec,
    /// Wall-clock time of successful units in seconds.
    pub unit_duration_seconds: Histogram,
    /// Job runs by how they ended.
    pub jobs_total: CounterVec,
    /// Jobs currently executing units.
    pub jobs_in_progress: Gauge,
}

fn prom_err(e: prometheus::Error) -> NotificationError {
    NotificationError::PrometheusFailed(e.to_string())
}

impl Metrics {
    /// Creates a new metrics instance with all gauges and counters.
    pub fn new() -> Result<Self, NotificationError> {
        let registry = Registry::new();

        let units_total = CounterVec::new(
            Opts::new("equirect_units_total", "Total number of finished unit attempts"),
            &["status"],
        )
        .map_err(prom_err)?;

        let unit_duration_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "equirect_unit_duration_seconds",
                "Time taken to convert one work unit in seconds",
            )
            .buckets(vec![10.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1800.0, 3600.0]),
        )
        .map_err(prom_err)?;

        let jobs_total = CounterVec::new(
            Opts::new("equirect_jobs_total", "Total number of job runs by outcome"),
            &["status"],
        )
        .map_err(prom_err)?;

        let jobs_in_progress = Gauge::new(
            "equirect_jobs_in_progress",
            "Number of jobs currently converting",
        )
        .map_err(prom_err)?;

        registry
            .register(Box::new(units_total.clone()))
            .map_err(prom_err)?;
        registry
            .register(Box::new(unit_duration_seconds.clone()))
            .map_err(prom_err)?;
        registry
            .register(Box::new(jobs_total.clone()))
            .map_err(prom_err)?;
        registry
            .register(Box::new(jobs_in_progress.clone()))
            .map_err(prom_err)?;

        Ok(Self {
            registry,
            units_total,
            unit_duration_seconds,
            jobs_total,
            jobs_in_progress,
        })
    }

    /// Updates the metrics from one progress event.
    pub fn observe(&self, event: &ProgressEvent) {
        match &event.kind {
            EventKind::StateChanged {
                state: CoordinatorState::Executing,
            } => self.jobs_in_progress.inc(),
            EventKind::UnitFinished {
                status, elapsed_ms, ..
            } => {
                let label = match status {
                    UnitStatus::Done => "done",
                    UnitStatus::Failed => "failed",
                    UnitStatus::Pending => "retried",
                    UnitStatus::InProgress => "in_progress",
                };
                self.units_total.with_label_values(&[label]).inc();
                if let (UnitStatus::Done, Some(ms)) = (status, elapsed_ms) {
                    self.unit_duration_seconds.observe(*ms as f64 / 1000.0);
                }
            }
            EventKind::Completed { .. } => self.finish_job("completed"),
            EventKind::Failed { .. } => self.finish_job("failed"),
            EventKind::Paused => self.finish_job("paused"),
            EventKind::Cancelled => {
                self.jobs_total.with_label_values(&["cancelled"]).inc();
            }
            _ => {}
        }
    }

    fn finish_job(&self, status: &str) {
        self.jobs_total.with_label_values(&[status]).inc();
        if self.jobs_in_progress.get() > 0.0 {
            self.jobs_in_progress.dec();
        }
    }

    /// Returns the metrics in Prometheus text format.
    pub fn gather(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            error!(error = %e, "Failed to encode metrics");
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }

    /// Consumes events until the channel closes.
    pub async fn follow(self: Arc<Self>, mut events: broadcast::Receiver<ProgressEvent>) {
        loop {
            match events.recv().await {
                Ok(event) => self.observe(&event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Metrics fell behind the event stream");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        debug!("Metrics event stream closed");
    }
}

/// HTTP server for Prometheus metrics.
pub struct MetricsServer {
    /// Metrics instance.
    metrics: Arc<Metrics>,
    /// Port to listen on.
    port: u16,
}

impl MetricsServer {
    /// Creates a new metrics server.
    pub fn new(metrics: Arc<Metrics>, port: u16) -> Self {
        Self { metrics, port }
    }

    /// Starts the metrics HTTP server.
    pub async fn start(self) -> Result<(), NotificationError> {
        use http_body_util::Full;
        use hyper::body::Bytes;
        use hyper::server::conn::http1;
        use hyper::service::service_fn;
        use hyper::{body::Incoming, Request, Response, StatusCode};
        use hyper_util::rt::TokioIo;

        let addr: SocketAddr = ([0, 0, 0, 0], self.port).into();
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| NotificationError::PrometheusFailed(e.to_string()))?;

        info!(port = self.port, "Starting Prometheus metrics server");

        loop {
            let (stream, _) = listener
                .accept()
                .await
                .map_err(|e| NotificationError::PrometheusFailed(e.to_string()))?;

            let io = TokioIo::new(stream);
            let metrics = self.metrics.clone();

            tokio::spawn(async move {
                let service = service_fn(|req: Request<Incoming>| {
                    let metrics = metrics.clone();
                    async move {
                        let mut response = if req.uri().path() == "/metrics" {
                            Response::new(Full::new(Bytes::from(metrics.gather())))
                        } else {
                            Response::new(Full::new(Bytes::from("Not Found")))
                        };
                        if req.uri().path() != "/metrics" {
                            *response.status_mut() = StatusCode::NOT_FOUND;
                        }
                        Ok::<_, hyper::Error>(response)
                    }
                });

                if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                    error!(error = %e, "Error serving connection");
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobId;
    use chrono::Utc;
    use std::path::PathBuf;

    fn event(kind: EventKind) -> ProgressEvent {
        ProgressEvent {
            job_id: JobId::from_string("job"),
            at: Utc::now(),
            kind,
        }
    }

    #[test]
    fn counts_units_and_jobs() {
        let metrics = Metrics::new().unwrap();

        metrics.observe(&event(EventKind::StateChanged {
            state: CoordinatorState::Executing,
        }));
        assert_eq!(metrics.jobs_in_progress.get(), 1.0);

        metrics.observe(&event(EventKind::UnitFinished {
            index: 0,
            status: UnitStatus::Done,
            elapsed_ms: Some(30_000),
        }));
        metrics.observe(&event(EventKind::UnitFinished {
            index: 1,
            status: UnitStatus::Pending,
            elapsed_ms: None,
        }));
        metrics.observe(&event(EventKind::Completed {
            output: PathBuf::from("/out.mp4"),
        }));

        assert_eq!(metrics.units_total.with_label_values(&["done"]).get(), 1.0);
        assert_eq!(metrics.units_total.with_label_values(&["retried"]).get(), 1.0);
        assert_eq!(metrics.jobs_total.with_label_values(&["completed"]).get(), 1.0);
        assert_eq!(metrics.jobs_in_progress.get(), 0.0);
        assert_eq!(metrics.unit_duration_seconds.get_sample_count(), 1);

        let text = metrics.gather();
        assert!(text.contains("equirect_units_total"));
    }
}
