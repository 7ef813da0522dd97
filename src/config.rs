//! Turns argv into an ordered list of [`TunnelSpec`]s plus the process-wide
//! settings from `config.c`'s `Config` struct.
//!
//! The top-level flags (`-f`/`-g`/`-n`/`-p`/`-u`/`-v`) are handled by `clap`
//! for usage text and flag parsing. The tunnel-spec grammar is not:
//! `host:port:remotehost[...]`
//! mixes a colon delimiter with bracketed IPv6 literals and `key=value`
//! options, which a generic arg parser would mis-split, so it gets its own
//! hand-written parser underneath `clap`'s positional argument collection,
//! same as `parseTunnel` sat underneath `Config_fromOpts`'s flag loop.

use std::path::PathBuf;

use clap::Parser;

use crate::client::AddressFamily;
use crate::error::{Error, Result};
use crate::tunnel::TunnelSpec;

const DEFAULT_PIDFILE: &str = "/var/run/relayd.pid";
const DEFAULT_BLACKLIST_HITS: u8 = 3;

#[derive(Parser, Debug)]
#[command(
    name = "relayd",
    about = "Multi-tunnel TCP forwarder with optional TLS termination/origination",
    version
)]
struct Cli {
    /// Run in the foreground; do not detach.
    #[arg(short = 'f')]
    foreground: bool,

    /// Group name or id to run as (defaults to the primary group of `-u`).
    #[arg(short = 'g', value_name = "group")]
    group: Option<String>,

    /// Use numeric hosts only; do not resolve addresses for display.
    #[arg(short = 'n')]
    numeric_hosts: bool,

    /// Use `pidfile` instead of the built-in default.
    #[arg(short = 'p', value_name = "pidfile")]
    pidfile: Option<PathBuf>,

    /// User name or id to run as.
    #[arg(short = 'u', value_name = "user")]
    user: Option<String>,

    /// Debug mode: log [DEBUG] messages too.
    #[arg(short = 'v')]
    verbose: bool,

    /// One or more `host:port:remotehost[:remoteport][:k=v[:...]]` specs.
    #[arg(required = true, value_name = "tunspec")]
    tunnels: Vec<String>,
}

/// Process-wide settings carried alongside the tunnel list, mirroring
/// `Config`'s non-tunnel fields. `uid`/`gid`/`daemonize` are parsed for
/// interface fidelity with the original flag grammar; nothing in this
/// crate acts on them, since the process always runs in the foreground.
#[derive(Debug, Clone)]
pub struct Config {
    pub tunnels: Vec<TunnelSpec>,
    pub pidfile: PathBuf,
    pub user: Option<String>,
    pub group: Option<String>,
    pub daemonize: bool,
    pub numeric_hosts: bool,
    pub verbose: bool,
}

/// Parse `std::env::args()` into a [`Config`], or return an error whose
/// `Display` is already the full usage text `clap` would have printed.
pub fn from_args() -> Result<Config> {
    from_args_in(std::env::args_os())
}

fn from_args_in<I, T>(args: I) -> Result<Config>
where
    I: IntoIterator<Item = T>,
    T: Into<std::ffi::OsString> + Clone,
{
    let cli = Cli::try_parse_from(args).map_err(|e| Error::config(e.to_string()))?;

    let mut tunnels = Vec::with_capacity(cli.tunnels.len());
    for spec in &cli.tunnels {
        tunnels.push(parse_tunnel_spec(spec)?);
    }

    Ok(Config {
        tunnels,
        pidfile: cli.pidfile.unwrap_or_else(|| PathBuf::from(DEFAULT_PIDFILE)),
        user: cli.user,
        group: cli.group,
        daemonize: !cli.foreground,
        numeric_hosts: cli.numeric_hosts,
        verbose: cli.verbose,
    })
}

/// Split `s` on `:`, treating a `[...]` run as one field even if it
/// contains colons (bracketed IPv6 literals).
fn split_spec(s: &str) -> Vec<&str> {
    let mut fields = Vec::new();
    let bytes = s.as_bytes();
    let mut start = 0;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'[' => {
                if let Some(end) = s[i..].find(']') {
                    i += end + 1;
                    continue;
                }
                i += 1;
            }
            b':' => {
                fields.push(&s[start..i]);
                i += 1;
                start = i;
            }
            _ => i += 1,
        }
    }
    fields.push(&s[start..]);
    fields
}

fn strip_brackets(host: &str) -> &str {
    host.strip_prefix('[').and_then(|h| h.strip_suffix(']')).unwrap_or(host)
}

fn parse_port(s: &str, what: &str) -> Result<u16> {
    s.parse::<u16>()
        .ok()
        .filter(|&p| p != 0)
        .ok_or_else(|| Error::config(format!("invalid {what} `{s}`: must be 1-65535")))
}

fn parse_proto(s: &str) -> Result<AddressFamily> {
    match s {
        "4" => Ok(AddressFamily::V4Only),
        "6" => Ok(AddressFamily::V6Only),
        other => Err(Error::config(format!("invalid protocol family `{other}`: expected 4 or 6"))),
    }
}

/// Parse one `host:port:remotehost[:remoteport][:k=v[:...]]` spec into a
/// [`TunnelSpec`]. `host` accepts a comma-separated list of bind addresses
/// (the original bound exactly one; binding several for the same port is a
/// natural generalization once `Listener` already loops over them).
fn parse_tunnel_spec(spec: &str) -> Result<TunnelSpec> {
    let fields = split_spec(spec);
    if fields.len() < 3 {
        return Err(Error::config(format!(
            "invalid tunnel spec `{spec}`: expected host:port:remotehost[...]"
        )));
    }

    let bind_hosts: Vec<String> = fields[0].split(',').map(|h| strip_brackets(h).to_string()).collect();
    if bind_hosts.iter().any(|h| h.is_empty()) {
        return Err(Error::config(format!("invalid tunnel spec `{spec}`: empty bind host")));
    }
    let bind_port = parse_port(fields[1], "bind port")?;
    let remote_host = strip_brackets(fields[2]).to_string();
    if remote_host.is_empty() {
        return Err(Error::config(format!("invalid tunnel spec `{spec}`: empty remote host")));
    }

    let mut remote_port = bind_port;
    let mut server_mode = false;
    let mut no_verify = false;
    let mut cert_file = None;
    let mut key_file = None;
    let mut client_proto = AddressFamily::Any;
    let mut server_proto = AddressFamily::Any;
    let mut blacklist_hits = DEFAULT_BLACKLIST_HITS;
    let mut remote_port_seen = false;

    for field in &fields[3..] {
        if field.is_empty() {
            continue;
        }
        if let Some((key, value)) = field.split_once('=') {
            match key {
                "b" => {
                    blacklist_hits = value
                        .parse()
                        .map_err(|_| Error::config(format!("invalid blacklist hit count `{value}`")))?;
                }
                "c" => cert_file = Some(value.to_string()),
                "k" => key_file = Some(value.to_string()),
                "p" => {
                    let proto = parse_proto(value)?;
                    client_proto = proto;
                    server_proto = proto;
                }
                "pc" => client_proto = parse_proto(value)?,
                "ps" => server_proto = parse_proto(value)?,
                _ => return Err(Error::config(format!("unknown tunnel option `{key}=` in `{spec}`"))),
            }
            continue;
        }
        match field {
            &"s" => server_mode = true,
            &"nv" => no_verify = true,
            _ if !remote_port_seen => {
                remote_port = parse_port(field, "remote port")?;
                remote_port_seen = true;
            }
            other => return Err(Error::config(format!("unrecognized tunnel option `{other}` in `{spec}`"))),
        }
    }

    Ok(TunnelSpec {
        bind_hosts,
        bind_port,
        remote_host,
        remote_port,
        server_mode,
        no_verify,
        cert_file,
        key_file,
        client_proto,
        server_proto,
        blacklist_hits,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(spec: &str) -> Result<TunnelSpec> {
        parse_tunnel_spec(spec)
    }

    #[test]
    fn minimal_spec_defaults_remote_port_to_bind_port() {
        let t = parse("0.0.0.0:8443:backend.internal").unwrap();
        assert_eq!(t.bind_port, 8443);
        assert_eq!(t.remote_port, 8443);
        assert!(!t.server_mode);
    }

    #[test]
    fn explicit_remote_port_and_flags() {
        let t = parse("0.0.0.0:443:backend.internal:9443:s:nv").unwrap();
        assert_eq!(t.remote_port, 9443);
        assert!(t.server_mode);
        assert!(t.no_verify);
    }

    #[test]
    fn bracketed_ipv6_literal_splits_correctly() {
        let t = parse("[::1]:443:[2001:db8::1]:9443").unwrap();
        assert_eq!(t.bind_hosts, vec!["::1".to_string()]);
        assert_eq!(t.remote_host, "2001:db8::1");
        assert_eq!(t.remote_port, 9443);
    }

    #[test]
    fn key_value_options() {
        let t = parse("0.0.0.0:443:backend:9443:c=cert.pem:k=key.pem:b=5:pc=4:ps=6").unwrap();
        assert_eq!(t.cert_file.as_deref(), Some("cert.pem"));
        assert_eq!(t.key_file.as_deref(), Some("key.pem"));
        assert_eq!(t.blacklist_hits, 5);
        assert_eq!(t.client_proto, AddressFamily::V4Only);
        assert_eq!(t.server_proto, AddressFamily::V6Only);
    }

    #[test]
    fn p_option_sets_both_protocols() {
        let t = parse("0.0.0.0:443:backend:9443:p=6").unwrap();
        assert_eq!(t.client_proto, AddressFamily::V6Only);
        assert_eq!(t.server_proto, AddressFamily::V6Only);
    }

    #[test]
    fn comma_separated_bind_hosts() {
        let t = parse("0.0.0.0,[::]:443:backend").unwrap();
        assert_eq!(t.bind_hosts, vec!["0.0.0.0".to_string(), "::".to_string()]);
    }

    #[test]
    fn rejects_missing_fields() {
        assert!(parse("0.0.0.0:443").is_err());
    }

    #[test]
    fn rejects_unknown_option() {
        assert!(parse("0.0.0.0:443:backend:9443:bogus=1").is_err());
    }

    #[test]
    fn full_cli_parses_flags_and_tunnels() {
        let cfg = from_args_in(["relayd", "-f", "-n", "-v", "0.0.0.0:443:backend:9443"]).unwrap();
        assert!(!cfg.daemonize);
        assert!(cfg.numeric_hosts);
        assert!(cfg.verbose);
        assert_eq!(cfg.tunnels.len(), 1);
    }
}
