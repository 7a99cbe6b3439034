//! Host-process command loop (§4.11/§6.3): the boundary between the
//! synchronous five-FD protocol the host speaks and the async pipeline.
//!
//! §6.3 pins the status-line vocabulary but leaves the command-FD protocol
//! itself to the implementer. This loop defines four commands — `SEND`,
//! `FETCH`, `TICK`, `QUIT` — each a single tab-separated line read from the
//! command FD, with any accompanying raw bytes (plaintext to send, or a
//! delivered mix envelope) read from the input FD. `SEND` takes the
//! recipient's session key material pre-resolved as command arguments
//! rather than performing a hash-chain walk itself, mirroring the same
//! caller-resolves-contact-material boundary `pipeline::to_send_to_encrypted`
//! already draws — the hash-chain/key-server resolution machinery lives in
//! `hashchain.rs`/`keyserver.rs` as library calls a richer host can chain in
//! front of `SEND`.

use std::fs::File;
use std::io::{BufRead, BufReader, Read, Write};
use std::os::unix::io::FromRawFd;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use ed25519_dalek::SigningKey;
use serde::Deserialize;
use thiserror::Error;

use crate::core;
use crate::nymaddress::{AddressTemplate, NymAddress};
use crate::pipeline::{self, PipelineError};
use crate::primitives::{self, OsRand};
use crate::transport::{MixClient, ReqwestMixClient};
use crate::wallet::{ReqwestTokenOracle, TokenOracle};

#[derive(Debug, Error)]
pub enum HostError {
    #[error("config error: {0}")]
    Config(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("core error: {0}")]
    Core(#[from] core::CoreError),
    #[error("pipeline error: {0}")]
    Pipeline(#[from] PipelineError),
    #[error("malformed command: {0}")]
    Malformed(String),
    #[error("wrong passphrase")]
    WrongPassphrase,
}

/// Loaded from a TOML file path given on the command line (or the default
/// `./mute.toml`). Covers everything the teacher's UniFFI boundary used to
/// receive as direct function arguments from the mobile app: now there is
/// no app process on the other end of an FFI call, only five file
/// descriptors, so this has to be read from disk at startup instead.
#[derive(Debug, Deserialize)]
pub struct MuteConfig {
    pub db_dir: String,
    pub mapped_id: String,
    pub identity_key_path: String,
    /// `prio,host[;prio,host]*` per §4.10; parsed by `config::UrlList` when a
    /// richer host wants to drive the signed-config fetcher in front of this
    /// loop. The loop itself only needs `mix_address`/`wallet_base_url`.
    pub key_server_urls: String,
    pub mix_address: String,
    pub mix_token_pub_key_hex: String,
    pub wallet_base_url: String,
    /// Path to a PEM-encoded CA certificate; when set, the mix and wallet
    /// HTTPS clients trust only this CA instead of the system root store —
    /// the HTTPS-transport analogue of §6.2's "hard-fail if a pinned CA is
    /// set and STARTTLS is absent".
    #[serde(default)]
    pub ca_cert_path: Option<String>,
    /// Seconds between mix key-list rotations (§4.4); defaults to one hour.
    #[serde(default = "default_mix_new_key_frequency_secs")]
    pub mix_new_key_frequency_secs: u64,
    /// Wallet retry schedule (§5): accepted here for the host to record and
    /// surface, though `wallet::get_token_with_retry`'s backoff constants
    /// are not yet parameterized by it — see DESIGN.md.
    #[serde(default = "default_wallet_retry_initial_ms")]
    pub wallet_retry_initial_ms: u64,
    #[serde(default = "default_wallet_retry_factor")]
    pub wallet_retry_factor: f64,
    #[serde(default = "default_wallet_retry_cap_secs")]
    pub wallet_retry_cap_secs: u64,
    pub fd_input: i32,
    pub fd_output: i32,
    pub fd_status: i32,
    pub fd_passphrase: i32,
    pub fd_command: i32,
}

fn default_mix_new_key_frequency_secs() -> u64 {
    3600
}

fn default_wallet_retry_initial_ms() -> u64 {
    100
}

fn default_wallet_retry_factor() -> f64 {
    1.5
}

fn default_wallet_retry_cap_secs() -> u64 {
    5
}

/// Builds the shared `reqwest::Client` used by the mix and wallet
/// connections, trusting only `ca_cert_path`'s certificate when set.
fn build_http_client(ca_cert_path: Option<&str>) -> Result<reqwest::Client, HostError> {
    let mut builder = reqwest::Client::builder();
    if let Some(path) = ca_cert_path {
        let pem = std::fs::read(path).map_err(HostError::Io)?;
        let cert = reqwest::Certificate::from_pem(&pem)
            .map_err(|e| HostError::Config(format!("invalid CA certificate: {e}")))?;
        builder = builder.add_root_certificate(cert).tls_built_in_root_certs(false);
    }
    builder
        .build()
        .map_err(|e| HostError::Config(format!("failed to build HTTP client: {e}")))
}

impl MuteConfig {
    pub fn load(path: &Path) -> Result<Self, HostError> {
        let text = std::fs::read_to_string(path).map_err(HostError::Io)?;
        toml::from_str(&text).map_err(|e| HostError::Config(e.to_string()))
    }
}

/// Derives a key-encryption key from the passphrase and opens the identity
/// key file (`iv ‖ AES-256-CBC(signing_key_bytes)`, per §1's "local DBs use
/// passphrase-derived keys"). Scoped to the identity key material only —
/// this crate's local stores are plain sqlite, not full disk encryption,
/// which would need a crate (e.g. sqlcipher bindings) outside the teacher's
/// dependency stack; recorded as a scope decision in DESIGN.md.
fn unseal_identity_key(path: &Path, passphrase: &[u8]) -> Result<SigningKey, HostError> {
    let blob = std::fs::read(path).map_err(HostError::Io)?;
    let kek = primitives::sha256(passphrase);
    let bytes = primitives::aes256_cbc_decrypt(&kek, &blob)
        .map_err(|_| HostError::WrongPassphrase)?;
    let key_bytes: [u8; 32] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| HostError::Config("identity key blob has the wrong length".into()))?;
    Ok(SigningKey::from_bytes(&key_bytes))
}

/// Seals a freshly generated signing key for first-run provisioning. Not
/// called by the loop itself; exposed so a setup tool can create the file
/// `unseal_identity_key` later reads.
pub fn seal_identity_key(
    signing_key: &SigningKey,
    passphrase: &[u8],
    rng: &mut dyn primitives::Rand,
) -> Result<Vec<u8>, HostError> {
    let kek = primitives::sha256(passphrase);
    primitives::aes256_cbc_encrypt(&kek, signing_key.as_bytes(), rng)
        .map_err(|e| HostError::Config(e.to_string()))
}

struct Fds {
    input: BufReader<File>,
    output: File,
    status: File,
    command: BufReader<File>,
}

impl Fds {
    fn from_config(cfg: &MuteConfig) -> Self {
        // SAFETY: these fds are handed to us by the host process and are
        // valid and open for the lifetime of this process, matching the
        // contract of §6.3's five-fd interface.
        unsafe {
            Self {
                input: BufReader::new(File::from_raw_fd(cfg.fd_input)),
                output: File::from_raw_fd(cfg.fd_output),
                status: File::from_raw_fd(cfg.fd_status),
                command: BufReader::new(File::from_raw_fd(cfg.fd_command)),
            }
        }
    }

    fn read_passphrase(cfg: &MuteConfig) -> std::io::Result<Vec<u8>> {
        let mut f = unsafe { File::from_raw_fd(cfg.fd_passphrase) };
        let mut line = String::new();
        BufReader::new(&mut f).read_line(&mut line)?;
        Ok(line.trim_end_matches(['\n', '\r']).as_bytes().to_vec())
    }

    fn status_line(&mut self, line: &str) -> std::io::Result<()> {
        writeln!(self.status, "{line}")
    }

    fn read_exact_from_input(&mut self, len: usize) -> std::io::Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.input.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn write_output(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.output.write_all(bytes)
    }
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

enum Command {
    Send { to_mapped_id: String, to_pub_key: [u8; 32], nym_address: NymAddress, length: usize },
    Fetch { length: usize },
    Tick,
    Quit,
}

fn parse_command(line: &str) -> Result<Command, HostError> {
    let mut parts = line.trim_end_matches(['\n', '\r']).split('\t');
    match parts.next() {
        Some("SEND") => {
            let to_mapped_id = parts
                .next()
                .ok_or_else(|| HostError::Malformed("SEND missing to_id".into()))?
                .to_string();
            let pub_key_hex = parts
                .next()
                .ok_or_else(|| HostError::Malformed("SEND missing pub key".into()))?;
            let nym_b64 = parts
                .next()
                .ok_or_else(|| HostError::Malformed("SEND missing nym address".into()))?;
            let length: usize = parts
                .next()
                .ok_or_else(|| HostError::Malformed("SEND missing length".into()))?
                .parse()
                .map_err(|_| HostError::Malformed("SEND length not a number".into()))?;
            let pub_key_bytes =
                hex::decode(pub_key_hex).map_err(|e| HostError::Malformed(e.to_string()))?;
            let to_pub_key: [u8; 32] = pub_key_bytes
                .try_into()
                .map_err(|_| HostError::Malformed("pub key must be 32 bytes".into()))?;
            let nym_bytes = base64::engine::general_purpose::STANDARD
                .decode(nym_b64)
                .map_err(|e| HostError::Malformed(e.to_string()))?;
            let nym_address = NymAddress::decode(&nym_bytes)
                .map_err(|e| HostError::Malformed(e.to_string()))?;
            Ok(Command::Send { to_mapped_id, to_pub_key, nym_address, length })
        }
        Some("FETCH") => {
            let length: usize = parts
                .next()
                .ok_or_else(|| HostError::Malformed("FETCH missing length".into()))?
                .parse()
                .map_err(|_| HostError::Malformed("FETCH length not a number".into()))?;
            Ok(Command::Fetch { length })
        }
        Some("TICK") => Ok(Command::Tick),
        Some("QUIT") => Ok(Command::Quit),
        Some(other) => Err(HostError::Malformed(format!("unknown command {other}"))),
        None => Err(HostError::Malformed("empty command line".into())),
    }
}

use base64::Engine as _;

/// Runs the synchronous command loop until `QUIT`. Bridges into the async
/// pipeline via `core::block_on`, exactly as every other ambient entry
/// point in this crate does.
pub fn run(config_path: &Path) -> Result<(), HostError> {
    let cfg = MuteConfig::load(config_path)?;
    let passphrase = Fds::read_passphrase(&cfg)?;
    let identity_key = unseal_identity_key(Path::new(&cfg.identity_key_path), &passphrase)?;
    drop(passphrase);

    core::block_on(core::bootstrap(
        identity_key,
        cfg.mapped_id.clone(),
        &cfg.db_dir,
        None,
    ))?;

    let http = build_http_client(cfg.ca_cert_path.as_deref())?;
    let mix_client = ReqwestMixClient::new_with_client(http.clone());
    let oracle = ReqwestTokenOracle::new_with_client(http, cfg.wallet_base_url.clone());
    let mut fds = Fds::from_config(&cfg);
    fds.status_line("READY.")?;

    loop {
        let mut line = String::new();
        let n = fds.command.read_line(&mut line)?;
        if n == 0 {
            break;
        }
        let command = match parse_command(&line) {
            Ok(c) => c,
            Err(e) => {
                fds.status_line(&format!("RESEND:\t{e}"))?;
                continue;
            }
        };
        match command {
            Command::Quit => {
                fds.status_line("QUITTING")?;
                break;
            }
            Command::Tick => {
                run_tick(&cfg, &mut fds, &mix_client, &oracle)?;
            }
            Command::Send { to_mapped_id, to_pub_key, nym_address, length } => {
                let plaintext = fds.read_exact_from_input(length)?;
                run_send(&cfg, &mut fds, &to_mapped_id, &to_pub_key, &nym_address, &plaintext)?;
            }
            Command::Fetch { length } => {
                let envelope = fds.read_exact_from_input(length)?;
                run_fetch(&cfg, &mut fds, &envelope)?;
            }
        }
    }
    Ok(())
}

fn run_send(
    cfg: &MuteConfig,
    fds: &mut Fds,
    to_mapped_id: &str,
    to_pub_key: &[u8; 32],
    nym_address: &NymAddress,
    plaintext: &[u8],
) -> Result<(), HostError> {
    let core = core::get_core().ok_or(core::CoreError::Init("not bootstrapped".into()))?;
    core::block_on(async {
        crate::db::insert_to_send(
            &core.db,
            &cfg.mapped_id,
            to_mapped_id,
            plaintext,
            true,
            0,
            0,
            now_unix() as i64,
            None,
        )
        .await
    })
    .map_err(|e| HostError::Pipeline(PipelineError::Db(e)))?;

    let sent = core::block_on(pipeline::to_send_to_encrypted(
        &core.db,
        core.sessions.as_ref(),
        Some(&core.signing_key),
        to_pub_key,
        nym_address,
        &mut OsRand,
    ))?;
    if sent {
        fds.status_line(&format!("SENDERIDENTITY:\t{}", cfg.mapped_id))?;
        fds.status_line("READY.")?;
    } else {
        fds.status_line("NONE")?;
    }
    Ok(())
}

fn run_tick(
    cfg: &MuteConfig,
    fds: &mut Fds,
    mix_client: &dyn MixClient,
    oracle: &dyn TokenOracle,
) -> Result<(), HostError> {
    let core = core::get_core().ok_or(core::CoreError::Init("not bootstrapped".into()))?;
    let outcome = core::block_on(pipeline::scheduler_tick(
        &core.db,
        mix_client,
        oracle,
        &cfg.mapped_id,
        now_unix() as i64,
        &mut OsRand,
    ))?;
    match outcome {
        None => fds.status_line("READY.")?,
        Some(crate::transport::SubmitOutcome::Delivered) => fds.status_line("READY.")?,
        Some(crate::transport::SubmitOutcome::Resend(detail)) => {
            fds.status_line(&format!("RESEND:\t{detail}"))?
        }
        Some(crate::transport::SubmitOutcome::Permanent(detail)) => {
            fds.status_line(&format!("RESEND:\t{detail}"))?
        }
    }
    Ok(())
}

fn run_fetch(cfg: &MuteConfig, fds: &mut Fds, envelope: &[u8]) -> Result<(), HostError> {
    let core = core::get_core().ok_or(core::CoreError::Init("not bootstrapped".into()))?;
    let mix_token_pub = hex::decode(&cfg.mix_token_pub_key_hex)
        .map_err(|e| HostError::Config(e.to_string()))?;
    let mix_token_pub: [u8; 32] = mix_token_pub
        .try_into()
        .map_err(|_| HostError::Config("mix_token_pub_key_hex must be 32 bytes".into()))?;
    let template = AddressTemplate { secret: mix_token_pub };
    let mailbox_address = cfg.mix_address.as_bytes().to_vec();
    let expected_my_id_hash = primitives::sha256(cfg.mapped_id.as_bytes());
    let message_id = primitives::sha256(envelope).to_vec();

    let result = core::block_on(pipeline::process_fetched_message(
        &core.db,
        core.sessions.as_ref(),
        &template,
        &cfg.mapped_id,
        &mailbox_address,
        &expected_my_id_hash,
        &message_id,
        envelope,
        now_unix() as i64,
    ));
    match result {
        Ok(()) => {
            let inbox: Option<(String, Vec<u8>, Option<Vec<u8>>)> = core::block_on(async {
                let rows = crate::db::list_to_send(&core.db).await.ok()?;
                let row = rows.into_iter().find(|r| r.to_id == cfg.mapped_id)?;
                crate::db::delete_to_send(&core.db, row.row_id).await.ok()?;
                Some((row.from_id, row.plaintext, row.signature))
            });
            match inbox {
                Some((sender_identity, plaintext, signature)) => {
                    fds.status_line(&format!("SENDERIDENTITY:\t{sender_identity}"))?;
                    if let Some(sig) = signature {
                        fds.status_line(&format!(
                            "SIGNATURE:\t{}",
                            base64::engine::general_purpose::STANDARD.encode(&sig)
                        ))?;
                    }
                    fds.status_line(&format!(
                        "MESSAGEID:\t{}",
                        base64::engine::general_purpose::STANDARD.encode(&message_id)
                    ))?;
                    fds.status_line(&format!("LENGTH:\t{}", plaintext.len()))?;
                    fds.status_line(&format!("RECEIVETIME:\t{}", now_unix()))?;
                    fds.write_output(&plaintext)?;
                    fds.status_line("READY.")?;
                }
                None => fds.status_line("NONE")?,
            }
        }
        Err(PipelineError::WrongMailbox) | Err(PipelineError::NoPreHeaderKey) => {
            fds.status_line("NONE")?;
        }
        Err(e) => return Err(e.into()),
    }
    Ok(())
}
