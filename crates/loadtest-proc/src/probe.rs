use std::sync::OnceLock;

use tracing::debug;

use crate::error::{ProcError, ProcResult};

/// Install the process-wide rustls crypto provider exactly once. `reqwest`'s
/// `rustls-tls-webpki-roots-no-provider` feature deliberately omits this so
/// the binary picks one; we need it before the first probe request.
fn install_rustls_provider() {
    static PROVIDER_INSTALLED: OnceLock<()> = OnceLock::new();
    PROVIDER_INSTALLED.get_or_init(|| {
        if let Err(err) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
            debug!(existing_provider = ?err, "rustls CryptoProvider already installed");
        }
    });
}

/// Fetch a master playlist once and return the index of the variant with
/// the highest (or, if `pick_highest` is false, lowest) advertised
/// bandwidth. The index matches ffmpeg's own 0-indexed `-map 0:p:<id>`
/// numbering for HLS master-playlist programs, which follows declaration
/// order in the `#EXT-X-STREAM-INF` list.
pub async fn probe_program_id(url: &str, pick_highest: bool) -> ProcResult<u32> {
    install_rustls_provider();

    let response = reqwest::get(url)
        .await
        .map_err(|err| probe_error(url, err.to_string()))?;
    let bytes = response
        .bytes()
        .await
        .map_err(|err| probe_error(url, err.to_string()))?;

    let playlist = m3u8_rs::parse_playlist_res(&bytes)
        .map_err(|_| probe_error(url, "response body is not a parseable m3u8 playlist".to_string()))?;

    let m3u8_rs::Playlist::MasterPlaylist(master) = playlist else {
        return Err(probe_error(
            url,
            "expected a master playlist, got a media playlist".to_string(),
        ));
    };

    let chosen = if pick_highest {
        master.variants.iter().enumerate().max_by_key(|(_, v)| v.bandwidth)
    } else {
        master.variants.iter().enumerate().min_by_key(|(_, v)| v.bandwidth)
    };

    chosen
        .map(|(idx, _)| idx as u32)
        .ok_or_else(|| probe_error(url, "master playlist lists no variants".to_string()))
}

fn probe_error(url: &str, message: String) -> ProcError {
    ProcError::ProbeFailed {
        url: url.to_string(),
        source: std::io::Error::new(std::io::ErrorKind::InvalidData, message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn picks_highest_bandwidth_variant_by_index() {
        let manifest = b"#EXTM3U\n#EXT-X-STREAM-INF:BANDWIDTH=800000\nlow.m3u8\n#EXT-X-STREAM-INF:BANDWIDTH=4500000\nhigh.m3u8\n#EXT-X-STREAM-INF:BANDWIDTH=2000000\nmid.m3u8\n";
        let playlist = m3u8_rs::parse_playlist_res(manifest).unwrap();
        let m3u8_rs::Playlist::MasterPlaylist(master) = playlist else {
            panic!("expected master playlist");
        };
        let idx = master
            .variants
            .iter()
            .enumerate()
            .max_by_key(|(_, v)| v.bandwidth)
            .map(|(i, _)| i)
            .unwrap();
        assert_eq!(idx, 1);
    }

    #[test]
    fn picks_lowest_bandwidth_variant_by_index() {
        let manifest = b"#EXTM3U\n#EXT-X-STREAM-INF:BANDWIDTH=800000\nlow.m3u8\n#EXT-X-STREAM-INF:BANDWIDTH=4500000\nhigh.m3u8\n";
        let playlist = m3u8_rs::parse_playlist_res(manifest).unwrap();
        let m3u8_rs::Playlist::MasterPlaylist(master) = playlist else {
            panic!("expected master playlist");
        };
        let idx = master
            .variants
            .iter()
            .enumerate()
            .min_by_key(|(_, v)| v.bandwidth)
            .map(|(i, _)| i)
            .unwrap();
        assert_eq!(idx, 0);
    }
}
