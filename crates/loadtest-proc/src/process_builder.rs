use std::net::IpAddr;

use crate::config::{ClientProcessConfig, ProgressMode, VariantSelection};

/// Builds the subprocess invocation for one HLS-fetching client.
///
/// Mirrors the flag-assembly style of an ffmpeg engine command builder: a
/// single method appends global options, reconnect/timeout knobs, headers,
/// the progress sink, the input, and finally a null-output stream map: no
/// intermediate struct, just an ordered `Vec<String>`.
#[derive(Debug, Clone)]
pub struct ProcessBuilder {
    config: ClientProcessConfig,
}

impl ProcessBuilder {
    pub fn new(config: ClientProcessConfig) -> Self {
        Self { config }
    }

    /// Assemble the argument list for `client_id`'s invocation.
    ///
    /// `resolved_program` is the program/variant index chosen by a prior
    /// probe when `variant` is [`VariantSelection::Highest`] or
    /// [`VariantSelection::Lowest`]; `None` falls back to mapping every
    /// stream, matching [`crate::config::VariantProbeFailurePolicy::Fallback`].
    pub fn build_args(
        &self,
        client_id: u64,
        progress: &ProgressMode,
        resolved_program: Option<u32>,
    ) -> Vec<String> {
        let mut args = vec![
            "-hide_banner".to_string(),
            "-loglevel".to_string(),
            self.config.log_filter.clone(),
            "-nostdin".to_string(),
        ];

        args.extend([
            "-reconnect".to_string(),
            "1".to_string(),
            "-reconnect_streamed".to_string(),
            "1".to_string(),
            "-reconnect_delay_max".to_string(),
            self.config.reconnect_delay_max.as_secs().to_string(),
            "-rw_timeout".to_string(),
            self.config.read_write_timeout.as_micros().to_string(),
        ]);

        args.extend([
            "-user_agent".to_string(),
            format!("{}/client-{}", self.config.user_agent_base, client_id),
        ]);

        if self.config.ip_override.is_some() {
            args.extend(["-tls_verify".to_string(), "0".to_string()]);
        }

        let mut header_lines: Vec<String> = Vec::new();
        if let Some(original_host) = self.original_host() {
            // IP-literal rewrite bypasses DNS but the origin still needs the
            // real hostname to route/terminate TLS for the right vhost.
            header_lines.push(format!("Host: {original_host}"));
        }
        header_lines.extend(
            self.config
                .custom_headers
                .iter()
                .map(|(k, v)| format!("{k}: {v}")),
        );
        if !header_lines.is_empty() {
            args.push("-headers".to_string());
            args.push(format!("{}\r\n", header_lines.join("\r\n")));
        }

        args.push("-progress".to_string());
        args.push(match progress {
            ProgressMode::Pipe => "pipe:1".to_string(),
            ProgressMode::Socket(path) => format!("unix://{}", path.display()),
        });

        args.push("-i".to_string());
        args.push(self.resolved_url(client_id));

        match self.config.variant {
            VariantSelection::All => {
                args.extend(["-map".to_string(), "0".to_string()]);
            }
            VariantSelection::First => {
                args.extend([
                    "-map".to_string(),
                    "0:v:0?".to_string(),
                    "-map".to_string(),
                    "0:a:0?".to_string(),
                ]);
            }
            VariantSelection::Highest | VariantSelection::Lowest => match resolved_program {
                Some(pid) => {
                    args.extend(["-map".to_string(), format!("0:p:{pid}")]);
                }
                None => {
                    args.extend(["-map".to_string(), "0".to_string()]);
                }
            },
        }

        args.extend([
            "-c".to_string(),
            "copy".to_string(),
            "-f".to_string(),
            "null".to_string(),
            "-".to_string(),
        ]);

        args
    }

    /// The input URL for `client_id`: the hostname rewritten to the
    /// configured IP literal when an override is set, plus an optional
    /// cache-busting query parameter.
    fn resolved_url(&self, client_id: u64) -> String {
        let base = self.host_rewritten_url().unwrap_or_else(|| self.config.url.clone());
        if !self.config.cache_bust {
            return base;
        }
        let separator = if base.contains('?') { '&' } else { '?' };
        format!("{base}{separator}cachebust=client-{client_id}")
    }

    /// The URL's original hostname, before any IP-literal rewrite. Used to
    /// synthesize the `Host:` header the rewritten request still needs.
    fn original_host(&self) -> Option<String> {
        self.config.ip_override?;
        let parsed = url::Url::parse(&self.config.url).ok()?;
        parsed.host_str().map(|h| h.to_string())
    }

    /// Rewrite the configured URL's host to the configured IP literal,
    /// keeping scheme, path, query, and port intact.
    fn host_rewritten_url(&self) -> Option<String> {
        let ip = self.config.ip_override?;
        let mut parsed = url::Url::parse(&self.config.url).ok()?;
        let literal = match ip {
            IpAddr::V4(v4) => v4.to_string(),
            IpAddr::V6(v6) => format!("[{v6}]"),
        };
        parsed.set_host(Some(&literal)).ok()?;
        Some(parsed.to_string())
    }

    pub fn binary_path(&self) -> &std::path::Path {
        &self.config.binary_path
    }

    pub fn variant(&self) -> VariantSelection {
        self.config.variant
    }

    pub fn variant_probe_failure_policy(&self) -> crate::config::VariantProbeFailurePolicy {
        self.config.variant_probe_failure_policy
    }

    pub fn url(&self) -> &str {
        &self.config.url
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::Duration;

    fn base_config() -> ClientProcessConfig {
        ClientProcessConfig {
            binary_path: PathBuf::from("ffmpeg"),
            url: "https://cdn.example.com/live/master.m3u8".to_string(),
            variant: VariantSelection::All,
            variant_probe_failure_policy: crate::config::VariantProbeFailurePolicy::Fallback,
            custom_headers: Vec::new(),
            cache_bust: false,
            user_agent_base: "hls-loadtest".to_string(),
            ip_override: None,
            acknowledge_dangerous: false,
            reconnect_delay_max: Duration::from_secs(2),
            read_write_timeout: Duration::from_secs(5),
            log_filter: "warning".to_string(),
        }
    }

    #[test]
    fn pipe_progress_uses_stdout_sink() {
        let builder = ProcessBuilder::new(base_config());
        let args = builder.build_args(3, &ProgressMode::Pipe, None);
        let idx = args.iter().position(|a| a == "-progress").unwrap();
        assert_eq!(args[idx + 1], "pipe:1");
        assert!(args.iter().any(|a| a == "client-3"));
    }

    #[test]
    fn socket_progress_uses_unix_uri() {
        let builder = ProcessBuilder::new(base_config());
        let mode = ProgressMode::Socket(PathBuf::from("/tmp/hls_1_0.sock"));
        let args = builder.build_args(0, &mode, None);
        let idx = args.iter().position(|a| a == "-progress").unwrap();
        assert_eq!(args[idx + 1], "unix:///tmp/hls_1_0.sock");
    }

    #[test]
    fn all_variant_maps_everything() {
        let builder = ProcessBuilder::new(base_config());
        let args = builder.build_args(0, &ProgressMode::Pipe, None);
        let idx = args.iter().position(|a| a == "-map").unwrap();
        assert_eq!(args[idx + 1], "0");
    }

    #[test]
    fn highest_variant_with_resolved_program_maps_program() {
        let mut config = base_config();
        config.variant = VariantSelection::Highest;
        let builder = ProcessBuilder::new(config);
        let args = builder.build_args(0, &ProgressMode::Pipe, Some(2));
        let idx = args.iter().position(|a| a == "-map").unwrap();
        assert_eq!(args[idx + 1], "0:p:2");
    }

    #[test]
    fn highest_variant_without_probe_falls_back_to_all() {
        let mut config = base_config();
        config.variant = VariantSelection::Highest;
        let builder = ProcessBuilder::new(config);
        let args = builder.build_args(0, &ProgressMode::Pipe, None);
        let idx = args.iter().position(|a| a == "-map").unwrap();
        assert_eq!(args[idx + 1], "0");
    }

    #[test]
    fn cache_bust_appends_unique_query_param() {
        let mut config = base_config();
        config.cache_bust = true;
        let builder = ProcessBuilder::new(config);
        let args = builder.build_args(5, &ProgressMode::Pipe, None);
        let idx = args.iter().position(|a| a == "-i").unwrap();
        assert!(args[idx + 1].contains("cachebust=client-5"));
    }

    #[test]
    fn ip_override_disables_tls_verification() {
        let mut config = base_config();
        config.ip_override = Some("203.0.113.10".parse().unwrap());
        let builder = ProcessBuilder::new(config);
        let args = builder.build_args(0, &ProgressMode::Pipe, None);
        assert!(args.windows(2).any(|w| w == ["-tls_verify", "0"]));
    }

    #[test]
    fn ip_override_rewrites_host_and_adds_host_header() {
        let mut config = base_config();
        config.ip_override = Some("203.0.113.10".parse().unwrap());
        let builder = ProcessBuilder::new(config);
        let args = builder.build_args(0, &ProgressMode::Pipe, None);

        let idx = args.iter().position(|a| a == "-i").unwrap();
        assert!(args[idx + 1].starts_with("https://203.0.113.10/"));

        let headers_idx = args.iter().position(|a| a == "-headers").unwrap();
        assert!(args[headers_idx + 1].starts_with("Host: cdn.example.com"));
    }

    #[test]
    fn custom_headers_are_joined_with_crlf() {
        let mut config = base_config();
        config.custom_headers = vec![
            ("X-Test".to_string(), "1".to_string()),
            ("Authorization".to_string(), "Bearer token".to_string()),
        ];
        let builder = ProcessBuilder::new(config);
        let args = builder.build_args(0, &ProgressMode::Pipe, None);
        let idx = args.iter().position(|a| a == "-headers").unwrap();
        assert!(args[idx + 1].contains("X-Test: 1\r\nAuthorization: Bearer token"));
    }
}
