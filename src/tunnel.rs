//! Pairs an accepted inbound connection with an outbound one and wires the
//! two together: this is the glue `server.c`/`client.c`/`tlsc.c` never had
//! to write explicitly, because the original program's `main` built it out
//! by hand for its single fixed tunnel. Here it is a reusable module since
//! a process may run many tunnels at once.

use std::cell::RefCell;
use std::io::BufReader;
use std::path::Path;
use std::rc::Rc;
use std::sync::Arc;

use rustls::{Certificate, PrivateKey};
use tracing::{info, warn};

use crate::blacklist::Blacklist;
use crate::client::{self, AddressFamily, ClientConfig};
use crate::connection::{Connection, DataReceivedArgs, TlsRole};
use crate::error::{Error, Result};
use crate::listener::Listener;
use crate::reactor::Reactor;
use crate::worker::WorkerPool;

/// One `host:port:remotehost[:remoteport][:k=v...]` tunnel definition.
#[derive(Debug, Clone)]
pub struct TunnelSpec {
    pub bind_hosts: Vec<String>,
    pub bind_port: u16,
    pub remote_host: String,
    pub remote_port: u16,
    pub server_mode: bool,
    pub no_verify: bool,
    pub cert_file: Option<String>,
    pub key_file: Option<String>,
    pub client_proto: AddressFamily,
    pub server_proto: AddressFamily,
    pub blacklist_hits: u8,
}

/// A running tunnel: one listener plus the glue that pairs each accepted
/// connection with an outbound leg.
pub struct Tunnel {
    reactor: Rc<RefCell<Reactor>>,
    worker_pool: Rc<RefCell<WorkerPool>>,
    blacklist: Rc<RefCell<Blacklist>>,
    spec: TunnelSpec,
    client_tls: Option<TlsRole>,
    listener: Rc<Listener>,
}

impl Tunnel {
    pub fn start(
        reactor: &Rc<RefCell<Reactor>>,
        worker_pool: &Rc<RefCell<WorkerPool>>,
        spec: TunnelSpec,
        numeric_hosts: bool,
    ) -> Result<Rc<Self>> {
        let blacklist = Rc::new(RefCell::new(Blacklist::with_hits(spec.blacklist_hits)));

        let server_tls = if spec.server_mode {
            Some(build_server_tls(&spec)?)
        } else {
            None
        };
        let client_tls = if spec.server_mode {
            None
        } else {
            build_client_tls(&spec)?
        };

        // connwait: an inbound connection must not read before wire_data has
        // registered its data_received handler, or anything the client sends
        // before the outbound leg connects is raised into an empty event and
        // lost.
        let listener = Listener::bind(
            reactor,
            Some(worker_pool.clone()),
            &spec.bind_hosts,
            spec.bind_port,
            numeric_hosts,
            server_tls,
            spec.server_proto,
            true,
        )?;

        let tunnel = Rc::new(Self {
            reactor: reactor.clone(),
            worker_pool: worker_pool.clone(),
            blacklist,
            spec,
            client_tls,
            listener,
        });

        let this = tunnel.clone();
        tunnel.listener.client_connected.register(move |conn| {
            this.on_client_connected(conn);
        });

        Ok(tunnel)
    }

    fn on_client_connected(&self, inbound: &Connection) {
        let cfg = ClientConfig {
            remote_host: self.spec.remote_host.clone(),
            port: self.spec.remote_port,
            proto: self.spec.client_proto,
            numeric_hosts: false,
            tls: self.client_tls.clone(),
        };

        let inbound = inbound.clone();
        let inbound_for_err = inbound.clone();
        let inbound_for_submit_err = inbound.clone();
        let result = client::connect_async(
            &self.reactor,
            &self.worker_pool,
            self.blacklist.clone(),
            cfg,
            move |outbound| match outbound {
                Some(outbound) => wire_pair(inbound, outbound),
                None => inbound_for_err.close(false),
            },
        );
        if let Err(e) = result {
            warn!(error = %e, "tunnel: could not submit outbound connection");
            inbound_for_submit_err.close(false);
        }
    }
}

fn wire_pair(a: Connection, b: Connection) {
    let b_for_a_close = b.clone();
    a.closed().register(move |_| b_for_a_close.close(false));
    let a_for_b_close = a.clone();
    b.closed().register(move |_| a_for_b_close.close(false));

    let a_for_wire = a.clone();
    let b_for_wire = b.clone();
    b.connected().register(move |_| {
        wire_data(a_for_wire.clone(), b_for_wire.clone());
        a_for_wire.resume();
    });
}

fn wire_data(a: Connection, b: Connection) {
    info!(a = %a.remote_addr(), b = %b.remote_addr(), "tunnel: pair established");

    let to_b = b.clone();
    a.data_received().register(move |args: &DataReceivedArgs| {
        args.hold();
        if to_b.write(args.data.clone(), None).is_err() {
            to_b.close(false);
        }
    });
    let confirm_a = a.clone();
    b.data_sent().register(move |_id| {
        confirm_a.confirm_data_received();
    });

    let to_a = a.clone();
    b.data_received().register(move |args: &DataReceivedArgs| {
        args.hold();
        if to_a.write(args.data.clone(), None).is_err() {
            to_a.close(false);
        }
    });
    let confirm_b = b.clone();
    a.data_sent().register(move |_id| {
        confirm_b.confirm_data_received();
    });
}

struct NoVerify;

impl rustls::client::ServerCertVerifier for NoVerify {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &rustls::ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: std::time::SystemTime,
    ) -> std::result::Result<rustls::client::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::ServerCertVerified::assertion())
    }
}

fn build_client_tls(spec: &TunnelSpec) -> Result<Option<TlsRole>> {
    let client_auth = match (&spec.cert_file, &spec.key_file) {
        (Some(cert), Some(key)) => Some((load_certs(cert)?, load_key(key)?)),
        (None, None) => None,
        _ => {
            warn!("tunnel: cert/key must both be given for client auth; ignoring");
            None
        }
    };

    let config = if spec.no_verify {
        let builder = rustls::ClientConfig::builder()
            .with_safe_defaults()
            .with_custom_certificate_verifier(Arc::new(NoVerify));
        match client_auth {
            Some((certs, key)) => builder
                .with_client_auth_cert(certs, key)
                .map_err(|e| Error::tls(e.to_string()))?,
            None => builder.with_no_client_auth(),
        }
    } else {
        let mut roots = rustls::RootCertStore::empty();
        roots.add_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.iter().map(|ta| {
            rustls::OwnedTrustAnchor::from_subject_spki_name_constraints(
                ta.subject,
                ta.spki,
                ta.name_constraints,
            )
        }));
        let builder = rustls::ClientConfig::builder().with_safe_defaults().with_root_certificates(roots);
        match client_auth {
            Some((certs, key)) => builder
                .with_client_auth_cert(certs, key)
                .map_err(|e| Error::tls(e.to_string()))?,
            None => builder.with_no_client_auth(),
        }
    };

    let server_name = server_name_for(&spec.remote_host)?;
    Ok(Some(TlsRole::Client { config: Arc::new(config), server_name }))
}

fn build_server_tls(spec: &TunnelSpec) -> Result<Arc<rustls::ServerConfig>> {
    let (cert_file, key_file) = match (&spec.cert_file, &spec.key_file) {
        (Some(c), Some(k)) => (c, k),
        _ => {
            return Err(Error::config(
                "a server-mode tunnel requires both a certificate and a key file",
            ))
        }
    };
    let certs = load_certs(cert_file)?;
    let key = load_key(key_file)?;
    let config = rustls::ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| Error::tls(e.to_string()))?;
    Ok(Arc::new(config))
}

fn load_certs(path: &str) -> Result<Vec<Certificate>> {
    let file = std::fs::File::open(Path::new(path))
        .map_err(|e| Error::config(format!("cannot open cert file `{path}`: {e}")))?;
    let mut reader = BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader)
        .map_err(|e| Error::config(format!("cannot parse cert file `{path}`: {e}")))?;
    Ok(certs.into_iter().map(Certificate).collect())
}

fn load_key(path: &str) -> Result<PrivateKey> {
    let file = std::fs::File::open(Path::new(path))
        .map_err(|e| Error::config(format!("cannot open key file `{path}`: {e}")))?;
    let mut reader = BufReader::new(file);
    let keys = rustls_pemfile::pkcs8_private_keys(&mut reader)
        .map_err(|e| Error::config(format!("cannot parse key file `{path}`: {e}")))?;
    keys.into_iter()
        .next()
        .map(PrivateKey)
        .ok_or_else(|| Error::config(format!("no private key found in `{path}`")))
}

fn server_name_for(host: &str) -> Result<rustls::ServerName> {
    if let Ok(ip) = host.parse::<std::net::IpAddr>() {
        return Ok(rustls::ServerName::IpAddress(ip));
    }
    rustls::ServerName::try_from(host).map_err(|e| Error::config(format!("invalid remote host `{host}`: {e}")))
}
