//! Join links for phones plus their QR rendering.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use qrcode::render::svg;
use qrcode::QrCode;
use std::net::IpAddr;
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum QrError {
    #[error("qr encoding failed: {0}")]
    Encode(#[from] qrcode::types::QrError),
}

/// Deep link a phone opens after scanning a relay QR. Carries only the
/// event, sid and image; the bearer token is exchanged later over HTTPS.
pub fn relay_join_link(base_url: &Url, event_id: &str, sid: &str, image_id: &str) -> String {
    format!(
        "{}/app/#e={}&sid={}&img={}",
        base_url.as_str().trim_end_matches('/'),
        event_id,
        sid,
        image_id
    )
}

/// LAN link served by the embedded web server.
pub fn local_join_link(host: &str, port: u16, session_id: &str, image_id: &str) -> String {
    format!("http://{host}:{port}/app?session={session_id}&image={image_id}")
}

/// Produces links for local-path sessions. The embedded web server supplies
/// the production implementation; tests pin a fixed host.
pub trait LocalLinkProvider: Send + Sync {
    fn join_link(&self, session_id: &str, image_id: &str) -> String;
}

/// Links phones to the embedded web server over whatever LAN address they
/// are most likely to reach.
#[derive(Debug, Clone, Copy)]
pub struct LanLinkProvider {
    pub port: u16,
}

impl LanLinkProvider {
    pub fn new(port: u16) -> Self {
        Self { port }
    }
}

impl LocalLinkProvider for LanLinkProvider {
    fn join_link(&self, session_id: &str, image_id: &str) -> String {
        local_join_link(&choose_preferred_host(), self.port, session_id, image_id)
    }
}

/// Picks the IPv4 address phones can actually reach. Wired and primary
/// interfaces win; loopback, link-local and virtual interfaces never
/// qualify.
pub fn choose_preferred_host() -> String {
    if let Ok(interfaces) = if_addrs::get_if_addrs() {
        let mut candidates: Vec<(i32, String)> = Vec::new();
        for iface in interfaces {
            let IpAddr::V4(v4) = iface.ip() else {
                continue;
            };
            if v4.is_loopback() || v4.is_link_local() {
                continue;
            }
            let name = iface.name.to_ascii_lowercase();
            if name.starts_with("awdl")
                || name.starts_with("llw")
                || name.starts_with("utun")
                || name.contains("bridge")
            {
                continue;
            }
            let score = if name.starts_with("en") {
                10
            } else if name.starts_with("eth") {
                20
            } else if name.starts_with("wl") {
                30
            } else {
                100
            };
            candidates.push((score, v4.to_string()));
        }
        if let Some((_, host)) = candidates.into_iter().min_by_key(|(score, _)| *score) {
            return host;
        }
    }
    "localhost".to_string()
}

/// Renders `data` as an SVG QR wrapped in a data URI, ready to be used as an
/// image source without touching the filesystem.
pub fn qr_svg_data_uri(data: &str) -> Result<String, QrError> {
    let code = QrCode::new(data)?;
    let svg = code
        .render::<svg::Color>()
        .quiet_zone(true)
        .min_dimensions(240, 240)
        .build();
    Ok(format!("data:image/svg+xml;base64,{}", STANDARD.encode(svg)))
}
