use std::sync::Arc;

use serde::Serialize;

/// Structured progress notifications emitted by the bandwidth tester and the
/// optimization loops. Serialized with the event name as a tag so consumers
/// see `{"event": "cycle_done", ...}` pairs.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    StartUserBandwidthTest {
        url: String,
    },
    UserBandwidthProgress {
        bytes: u64,
        elapsed: f64,
    },
    UserBandwidthDone {
        mbps: f64,
    },
    ProxyBandwidthProgress {
        proxy: String,
        bytes: u64,
        idx: usize,
    },
    ProxyBandwidthDone {
        proxy: String,
        mbps: f64,
        idx: usize,
    },
    ProxyBandwidthAvg {
        mbps: f64,
    },
    CycleStart,
    CycleDone {
        user_bandwidth_mbps: f64,
        proxy_avg_bandwidth_mbps: f64,
        optimal_proxy_count: usize,
        total_proxies: usize,
    },
}

/// Destination for progress events. A disabled sink drops everything, which
/// is what the internal optimizer pass uses; the continuous-optimization loop
/// installs a callback that surfaces events to the user.
#[derive(Clone, Default)]
pub struct EventSink {
    callback: Option<Arc<dyn Fn(&ProgressEvent) + Send + Sync>>,
}

impl EventSink {
    pub fn new<F>(callback: F) -> Self
    where
        F: Fn(&ProgressEvent) + Send + Sync + 'static,
    {
        Self {
            callback: Some(Arc::new(callback)),
        }
    }

    pub fn disabled() -> Self {
        Self { callback: None }
    }

    pub fn emit(&self, event: ProgressEvent) {
        if let Some(callback) = &self.callback {
            callback(&event);
        }
    }
}

impl std::fmt::Debug for EventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSink")
            .field("enabled", &self.callback.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_event_names_serialize_as_tags() {
        let event = ProgressEvent::CycleDone {
            user_bandwidth_mbps: 95.0,
            proxy_avg_bandwidth_mbps: 20.0,
            optimal_proxy_count: 6,
            total_proxies: 10,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "cycle_done");
        assert_eq!(json["optimal_proxy_count"], 6);

        let start = ProgressEvent::StartUserBandwidthTest {
            url: "https://example.com/file.bin".into(),
        };
        let json = serde_json::to_value(&start).unwrap();
        assert_eq!(json["event"], "start_user_bandwidth_test");
    }

    #[test]
    fn test_cycle_start_has_no_fields() {
        let json = serde_json::to_value(ProgressEvent::CycleStart).unwrap();
        assert_eq!(json, serde_json::json!({"event": "cycle_start"}));
    }

    #[test]
    fn test_sink_invokes_callback() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let captured = seen.clone();
        let sink = EventSink::new(move |event| {
            captured
                .lock()
                .unwrap()
                .push(serde_json::to_string(event).unwrap());
        });

        sink.emit(ProgressEvent::CycleStart);
        sink.emit(ProgressEvent::UserBandwidthDone { mbps: 12.5 });

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert!(seen[0].contains("cycle_start"));
    }

    #[test]
    fn test_disabled_sink_is_a_noop() {
        EventSink::disabled().emit(ProgressEvent::CycleStart);
    }
}
