//! Process-wide counters and histograms with Prometheus text exposition.
//!
//! The registry is a plain struct of atomics; gauges that need external
//! lookups (queue depth, active bots) are appended by the scrape handler.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Upper bounds of the duration buckets, seconds.
const BUCKETS: [f64; 10] = [0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 120.0];

/// Fixed-bucket histogram. `observe` takes seconds.
#[derive(Debug, Default)]
pub struct Histogram {
    counts: [AtomicU64; BUCKETS.len()],
    count: AtomicU64,
    /// Sum in microseconds to stay integral under concurrent adds.
    sum_micros: AtomicU64,
}

impl Histogram {
    pub fn observe(&self, seconds: f64) {
        for (i, bound) in BUCKETS.iter().enumerate() {
            if seconds <= *bound {
                self.counts[i].fetch_add(1, Ordering::Relaxed);
            }
        }
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_micros
            .fetch_add((seconds * 1_000_000.0) as u64, Ordering::Relaxed);
    }

    fn render(&self, name: &str, labels: &str, out: &mut String) {
        for (i, bound) in BUCKETS.iter().enumerate() {
            out.push_str(&format!(
                "{name}_bucket{{{labels}le=\"{bound}\"}} {}\n",
                self.counts[i].load(Ordering::Relaxed)
            ));
        }
        let count = self.count.load(Ordering::Relaxed);
        out.push_str(&format!("{name}_bucket{{{labels}le=\"+Inf\"}} {count}\n"));
        out.push_str(&format!(
            "{name}_sum{{{labels}}} {}\n",
            self.sum_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0
        ));
        out.push_str(&format!("{name}_count{{{labels}}} {count}\n"));
    }
}

/// All counters exported at /metrics.
#[derive(Debug, Default)]
pub struct Metrics {
    pub updates_received: Counter,
    pub updates_deduped: Counter,
    pub updates_rejected: Counter,
    pub tasks_started: Counter,
    pub tasks_succeeded: Counter,
    pub tasks_retried: Counter,
    pub tasks_dead_lettered: Counter,
    pub external_api_errors: Counter,
    pub llm_calls: Counter,
    pub whisper_calls: Counter,
    pub blocks_sent: Counter,
    pub messages_processed: Counter,
    pub credit_debits_cents: Counter,
    pub credit_drops: Counter,
    pub sales_approved: Counter,
    pub recovery_steps_sent: Counter,
    pub task_duration: Histogram,
}

impl Metrics {
    /// Render the static portion of the exposition. The scrape handler
    /// appends live gauges (queue depth, active bots) after this.
    pub fn render(&self) -> String {
        let mut out = String::with_capacity(2048);
        let counters: [(&str, &Counter); 16] = [
            ("hive_updates_received_total", &self.updates_received),
            ("hive_updates_deduped_total", &self.updates_deduped),
            ("hive_updates_rejected_total", &self.updates_rejected),
            ("hive_tasks_started_total", &self.tasks_started),
            ("hive_tasks_succeeded_total", &self.tasks_succeeded),
            ("hive_tasks_retried_total", &self.tasks_retried),
            ("hive_tasks_dead_lettered_total", &self.tasks_dead_lettered),
            ("hive_external_api_errors_total", &self.external_api_errors),
            ("hive_llm_calls_total", &self.llm_calls),
            ("hive_whisper_calls_total", &self.whisper_calls),
            ("hive_blocks_sent_total", &self.blocks_sent),
            ("hive_messages_processed_total", &self.messages_processed),
            ("hive_credit_debits_cents_total", &self.credit_debits_cents),
            ("hive_credit_drops_total", &self.credit_drops),
            ("hive_sales_approved_total", &self.sales_approved),
            ("hive_recovery_steps_sent_total", &self.recovery_steps_sent),
        ];
        for (name, c) in counters {
            out.push_str(&format!("# TYPE {name} counter\n{name} {}\n", c.get()));
        }
        out.push_str("# TYPE hive_task_duration_seconds histogram\n");
        self.task_duration
            .render("hive_task_duration_seconds", "", &mut out);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let m = Metrics::default();
        m.updates_received.inc();
        m.updates_received.add(2);
        assert_eq!(m.updates_received.get(), 3);
    }

    #[test]
    fn histogram_buckets_are_cumulative() {
        let h = Histogram::default();
        h.observe(0.02);
        h.observe(0.02);
        h.observe(4.0);
        let mut out = String::new();
        h.render("d", "", &mut out);
        assert!(out.contains("d_bucket{le=\"0.05\"} 2"));
        assert!(out.contains("d_bucket{le=\"5\"} 3"));
        assert!(out.contains("d_count{} 3"));
    }

    #[test]
    fn render_contains_every_counter() {
        let m = Metrics::default();
        let text = m.render();
        assert!(text.contains("hive_sales_approved_total 0"));
        assert!(text.contains("hive_task_duration_seconds_count"));
    }
}
