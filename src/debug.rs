use std::env;
use std::sync::atomic::{AtomicBool, Ordering};

static DEBUG_MODE: AtomicBool = AtomicBool::new(false);
static TRACE_MODE: AtomicBool = AtomicBool::new(false);

/// Initialize debug mode from environment variables
///
/// - `LEANWIRE_DEBUG=1`: Enable JSON pretty-printing of payloads
/// - `LEANWIRE_TRACE=1`: Enable human-readable trace logging of operations
pub fn init_debug_mode() {
    let debug = env::var("LEANWIRE_DEBUG").is_ok();
    let trace = env::var("LEANWIRE_TRACE").is_ok();

    DEBUG_MODE.store(debug, Ordering::Relaxed);
    TRACE_MODE.store(trace, Ordering::Relaxed);

    if debug {
        eprintln!("[LEANWIRE] Debug mode enabled - payloads will be logged as JSON");
    }

    if trace {
        eprintln!("[LEANWIRE] Trace mode enabled - human-readable operation logs");
    }
}

/// Check if debug mode is enabled
pub fn is_debug_enabled() -> bool {
    DEBUG_MODE.load(Ordering::Relaxed)
}

/// Check if trace mode is enabled
pub fn is_trace_enabled() -> bool {
    TRACE_MODE.load(Ordering::Relaxed)
}

/// Log a payload in JSON format if debug mode is enabled
pub fn log_payload(label: &str, payload: &[u8]) {
    if !is_debug_enabled() {
        return;
    }

    match serde_json::from_slice::<serde_json::Value>(payload) {
        Ok(value) => match serde_json::to_string_pretty(&value) {
            Ok(json) => {
                eprintln!("\n[LEANWIRE] {} ({}):\n{}\n", label, format_bytes(payload.len()), json);
            }
            Err(e) => {
                eprintln!("[LEANWIRE] Failed to pretty-print payload: {}", e);
            }
        },
        Err(_) => {
            eprintln!("[LEANWIRE] {} ({}, non-JSON)", label, format_bytes(payload.len()));
        }
    }
}

/// Trace a reduction operation
pub fn trace_reduction(before_bytes: usize, after_bytes: usize) {
    if !is_trace_enabled() {
        return;
    }

    let ratio = if after_bytes > 0 {
        before_bytes as f64 / after_bytes as f64
    } else {
        0.0
    };

    eprintln!("[LEANWIRE] Reduced {} → {} ({:.2}× reduction)",
        format_bytes(before_bytes), format_bytes(after_bytes), ratio);
}

/// Trace a learning sample
pub fn trace_learning(sampled: u32, factor: u32) {
    if !is_trace_enabled() {
        return;
    }

    eprintln!("[LEANWIRE] Learning sample {}/{}", sampled, factor);
}

/// Trace a producer state transition
pub fn trace_state(state: &str) {
    if !is_trace_enabled() {
        return;
    }

    eprintln!("[LEANWIRE] Producer state → {}", state);
}

/// Trace a control-plane send
pub fn trace_control_send(subject: &str, bytes: usize) {
    if !is_trace_enabled() {
        return;
    }

    eprintln!("[LEANWIRE] → Sent {} to {}", format_bytes(bytes), subject);
}

/// Trace a control-plane receive
pub fn trace_control_receive(subject: &str, bytes: usize) {
    if !is_trace_enabled() {
        return;
    }

    eprintln!("[LEANWIRE] ← Received {} from {}", format_bytes(bytes), subject);
}

/// Format bytes in human-readable format (KB, MB, etc.)
pub fn format_bytes(bytes: usize) -> String {
    const KB: usize = 1024;
    const MB: usize = KB * 1024;
    const GB: usize = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} bytes", bytes)
    }
}
