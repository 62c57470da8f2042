//! Metrics collection.
//!
//! # Metrics
//! - `netstack_tcp_accepted_total` (counter): connections handed to a listener handler
//! - `netstack_tcp_accept_noise_total` (counter): accepted sockets dropped before delivery, by reason
//! - `netstack_rate_limited_total` (counter): connections refused by a rate limiter, by reason
//! - `netstack_tcp_connections_active` (gauge): in-flight accepted-connection handlers
//! - `netstack_listener_status` (gauge): 0=trying, 1=listening, 2=stopped, by port
//! - `netstack_udp_datagrams_total` (counter): by direction (rx/tx/drop)
//! - `netstack_udp_bind_points_active` (gauge): bound receive instances
//!
//! # Design Decisions
//! - Recording goes through the `metrics` facade; no exporter is installed here
//! - Updates are cheap enough for the per-datagram path

pub fn record_accepted(port: u16) {
    metrics::counter!("netstack_tcp_accepted_total", "port" => port.to_string()).increment(1);
}

pub fn record_accept_noise(reason: &'static str) {
    metrics::counter!("netstack_tcp_accept_noise_total", "reason" => reason).increment(1);
}

pub fn set_active_connections(count: u64) {
    metrics::gauge!("netstack_tcp_connections_active").set(count as f64);
}

pub fn set_listener_status(port: u16, status: u8) {
    metrics::gauge!("netstack_listener_status", "port" => port.to_string()).set(f64::from(status));
}

pub fn record_datagrams(direction: &'static str, count: usize) {
    metrics::counter!("netstack_udp_datagrams_total", "direction" => direction)
        .increment(count as u64);
}

pub fn set_active_bind_points(count: usize) {
    metrics::gauge!("netstack_udp_bind_points_active").set(count as f64);
}

pub fn record_rate_limited(reason: &'static str) {
    metrics::counter!("netstack_rate_limited_total", "reason" => reason).increment(1);
}
