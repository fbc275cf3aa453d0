//! Prometheus counters for the delivery pipeline

use prometheus::{Encoder, IntCounterVec, Opts, Registry, TextEncoder};

/// Owns a registry so tests and multiple instances never collide
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    emails: IntCounterVec,
    jobs: IntCounterVec,
    tracking_events: IntCounterVec,
}

impl Metrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let emails = IntCounterVec::new(
            Opts::new("acremail_emails_total", "Emails handed to the provider"),
            &["outcome"],
        )?;
        let jobs = IntCounterVec::new(
            Opts::new("acremail_jobs_total", "Queue jobs finished"),
            &["kind", "outcome"],
        )?;
        let tracking_events = IntCounterVec::new(
            Opts::new("acremail_tracking_events_total", "Tracking events recorded"),
            &["event_type"],
        )?;

        registry.register(Box::new(emails.clone()))?;
        registry.register(Box::new(jobs.clone()))?;
        registry.register(Box::new(tracking_events.clone()))?;

        Ok(Self {
            registry,
            emails,
            jobs,
            tracking_events,
        })
    }

    pub fn email_sent(&self) {
        self.emails.with_label_values(&["sent"]).inc();
    }

    pub fn email_failed(&self) {
        self.emails.with_label_values(&["failed"]).inc();
    }

    /// `outcome` is one of completed, retried, failed
    pub fn job_finished(&self, kind: &str, outcome: &str) {
        self.jobs.with_label_values(&[kind, outcome]).inc();
    }

    pub fn tracking_event(&self, event_type: &str) {
        self.tracking_events.with_label_values(&[event_type]).inc();
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Text exposition format
    pub fn render(&self) -> String {
        let mut buffer = Vec::new();
        if TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .is_err()
        {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}
