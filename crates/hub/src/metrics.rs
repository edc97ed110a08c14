use std::{
    collections::HashMap,
    fmt::Write as _,
    sync::{
        atomic::{AtomicI64, AtomicU64, Ordering},
        Mutex, MutexGuard, PoisonError,
    },
};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
struct EndpointMetricKey {
    method: String,
    endpoint: String,
}

const LOCK_OUTCOMES: [&str; 4] = ["granted", "denied", "released", "expired"];

/// In-process counters exported at `GET /metrics`.
pub struct HubMetrics {
    request_rate_total: Mutex<HashMap<EndpointMetricKey, u64>>,
    request_errors_total: Mutex<HashMap<EndpointMetricKey, u64>>,
    request_duration_sum_ms: Mutex<HashMap<EndpointMetricKey, u64>>,
    open_connections: AtomicI64,
    connections_total: AtomicU64,
    inbound_messages_total: Mutex<HashMap<String, u64>>,
    dropped_frames_total: AtomicU64,
    broadcasts_total: AtomicU64,
    deliveries_total: AtomicU64,
    lock_events_total: Mutex<HashMap<String, u64>>,
}

impl Default for HubMetrics {
    fn default() -> Self {
        let lock_events_total =
            LOCK_OUTCOMES.iter().map(|outcome| (outcome.to_string(), 0)).collect();

        Self {
            request_rate_total: Mutex::new(HashMap::new()),
            request_errors_total: Mutex::new(HashMap::new()),
            request_duration_sum_ms: Mutex::new(HashMap::new()),
            open_connections: AtomicI64::new(0),
            connections_total: AtomicU64::new(0),
            inbound_messages_total: Mutex::new(HashMap::new()),
            dropped_frames_total: AtomicU64::new(0),
            broadcasts_total: AtomicU64::new(0),
            deliveries_total: AtomicU64::new(0),
            lock_events_total: Mutex::new(lock_events_total),
        }
    }
}

impl HubMetrics {
    pub fn record_http_request(&self, method: &str, path: &str, status_code: u16, latency_ms: u64) {
        let key = EndpointMetricKey {
            method: method.to_ascii_uppercase(),
            endpoint: normalize_endpoint(path),
        };

        increment(&self.request_rate_total, key.clone(), 1);
        increment(&self.request_duration_sum_ms, key.clone(), latency_ms);
        if status_code >= 400 {
            increment(&self.request_errors_total, key, 1);
        }
    }

    pub fn connection_opened(&self) {
        self.open_connections.fetch_add(1, Ordering::SeqCst);
        self.connections_total.fetch_add(1, Ordering::SeqCst);
    }

    pub fn connection_closed(&self) {
        self.open_connections.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn record_inbound(&self, message_type: &str) {
        increment(&self.inbound_messages_total, message_type.to_string(), 1);
    }

    pub fn record_dropped_frame(&self) {
        self.dropped_frames_total.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_broadcast(&self, delivered: usize) {
        self.broadcasts_total.fetch_add(1, Ordering::SeqCst);
        self.deliveries_total.fetch_add(delivered as u64, Ordering::SeqCst);
    }

    /// `outcome` is one of `granted`, `denied`, `released`, `expired`.
    pub fn record_lock_event(&self, outcome: &str, count: u64) {
        if count > 0 {
            increment(&self.lock_events_total, outcome.to_string(), count);
        }
    }

    pub fn open_connections(&self) -> i64 {
        self.open_connections.load(Ordering::SeqCst)
    }

    pub fn render_prometheus(&self) -> String {
        let mut output = String::new();

        header(&mut output, "hub_request_rate_total", "counter", "Total HTTP requests by endpoint.");
        append_endpoint_lines(&mut output, "hub_request_rate_total", &self.request_rate_total);

        header(
            &mut output,
            "hub_request_errors_total",
            "counter",
            "Total HTTP error responses by endpoint.",
        );
        append_endpoint_lines(&mut output, "hub_request_errors_total", &self.request_errors_total);

        header(
            &mut output,
            "hub_request_duration_ms_sum",
            "counter",
            "Sum of HTTP request latency in milliseconds by endpoint.",
        );
        append_endpoint_lines(
            &mut output,
            "hub_request_duration_ms_sum",
            &self.request_duration_sum_ms,
        );

        header(&mut output, "hub_ws_open_connections", "gauge", "Currently open websockets.");
        let _ = writeln!(output, "hub_ws_open_connections {}", self.open_connections());

        header(&mut output, "hub_ws_connections_total", "counter", "Websockets admitted.");
        let _ = writeln!(
            output,
            "hub_ws_connections_total {}",
            self.connections_total.load(Ordering::SeqCst)
        );

        header(
            &mut output,
            "hub_ws_inbound_messages_total",
            "counter",
            "Inbound websocket messages by type.",
        );
        append_label_lines(
            &mut output,
            "hub_ws_inbound_messages_total",
            "type",
            &self.inbound_messages_total,
        );

        header(
            &mut output,
            "hub_ws_dropped_frames_total",
            "counter",
            "Malformed or unrecognized inbound frames.",
        );
        let _ = writeln!(
            output,
            "hub_ws_dropped_frames_total {}",
            self.dropped_frames_total.load(Ordering::SeqCst)
        );

        header(&mut output, "hub_broadcasts_total", "counter", "Fan-out operations.");
        let _ =
            writeln!(output, "hub_broadcasts_total {}", self.broadcasts_total.load(Ordering::SeqCst));

        header(&mut output, "hub_deliveries_total", "counter", "Frames queued to sockets.");
        let _ =
            writeln!(output, "hub_deliveries_total {}", self.deliveries_total.load(Ordering::SeqCst));

        header(&mut output, "hub_frame_lock_events_total", "counter", "Frame lock transitions.");
        append_label_lines(
            &mut output,
            "hub_frame_lock_events_total",
            "outcome",
            &self.lock_events_total,
        );

        output
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn increment<K: std::hash::Hash + Eq>(map: &Mutex<HashMap<K, u64>>, key: K, delta: u64) {
    let mut guard = lock(map);
    let value = guard.entry(key).or_insert(0);
    *value = value.saturating_add(delta);
}

fn header(output: &mut String, name: &str, kind: &str, help: &str) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} {kind}");
}

fn append_endpoint_lines(
    output: &mut String,
    metric_name: &str,
    map: &Mutex<HashMap<EndpointMetricKey, u64>>,
) {
    let guard = lock(map);
    let mut entries: Vec<_> = guard.iter().collect();
    entries.sort_by(|(left, _), (right, _)| left.cmp(right));

    for (key, value) in entries {
        let _ = writeln!(
            output,
            "{metric_name}{{method=\"{}\",endpoint=\"{}\"}} {value}",
            escape_label_value(&key.method),
            escape_label_value(&key.endpoint),
        );
    }
}

fn append_label_lines(
    output: &mut String,
    metric_name: &str,
    label_name: &str,
    map: &Mutex<HashMap<String, u64>>,
) {
    let guard = lock(map);
    let mut entries: Vec<_> = guard.iter().collect();
    entries.sort_by(|(left, _), (right, _)| left.cmp(right));

    for (label, value) in entries {
        let _ = writeln!(
            output,
            "{metric_name}{{{label_name}=\"{}\"}} {value}",
            escape_label_value(label),
        );
    }
}

// Collapse identifiers so per-workspace paths share one series.
fn normalize_endpoint(path: &str) -> String {
    let segments: Vec<&str> = path.split('/').filter(|segment| !segment.is_empty()).collect();
    if segments.is_empty() {
        return "/".to_string();
    }

    let normalized: Vec<&str> = segments
        .iter()
        .enumerate()
        .map(|(index, segment)| match index.checked_sub(1).map(|previous| segments[previous]) {
            Some("workspaces" | "users" | "canvases" | "ws") => "{id}",
            _ => *segment,
        })
        .collect();

    format!("/{}", normalized.join("/"))
}

fn escape_label_value(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\n', "\\n").replace('"', "\\\"")
}
