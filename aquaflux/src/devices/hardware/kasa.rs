use crate::{
    devices::hardware::network::NetworkActuator,
    error::{OutputError, Result},
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};
use tracing::debug;

/// Port the TP-Link smart home protocol listens on.
pub const KASA_PORT: u16 = 9999;

/// Initial key of the XOR autokey cipher.
const CIPHER_KEY: u8 = 171;

/// Responses larger than this are treated as a protocol error.
const MAX_RESPONSE_LEN: usize = 64 * 1024;

/// Encrypt a request and add the 4 byte big endian length header.
pub fn encrypt(plain: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(plain.len() + 4);
    out.extend_from_slice(&(plain.len() as u32).to_be_bytes());
    let mut key = CIPHER_KEY;
    for byte in plain {
        key ^= byte;
        out.push(key);
    }
    out
}

/// Decrypt a response body (without the length header).
pub fn decrypt(cipher: &[u8]) -> Vec<u8> {
    let mut key = CIPHER_KEY;
    cipher
        .iter()
        .map(|byte| {
            let plain = key ^ byte;
            key = *byte;
            plain
        })
        .collect()
}

#[derive(Deserialize, Debug)]
struct SysInfoResponse {
    system: SysInfoSection,
}

#[derive(Deserialize, Debug)]
struct SysInfoSection {
    get_sysinfo: SysInfo,
}

/// The parts of `get_sysinfo` the outputs care about.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SysInfo {
    #[serde(default)]
    pub alias: String,
    #[serde(default)]
    pub model: String,
    /// Present on single outlet plugs.
    pub relay_state: Option<u8>,
    /// Present on power strips, one per outlet.
    #[serde(default)]
    pub children: Vec<ChildInfo>,
    #[serde(default)]
    pub err_code: i64,
}

/// One outlet of a power strip.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ChildInfo {
    pub id: String,
    pub state: u8,
    #[serde(default)]
    pub alias: String,
}

/// Single request/response client. Each request uses its own connection,
/// which is what the plugs expect.
#[derive(Debug, Clone)]
pub struct KasaClient {
    host: String,
    port: u16,
    timeout: Duration,
}

impl KasaClient {
    pub fn new(host: impl Into<String>, port: u16, timeout: Duration) -> Self {
        Self {
            host: host.into(),
            port,
            timeout,
        }
    }

    /// Send one JSON request and wait for the decoded response.
    pub async fn request(&self, request: &Value) -> Result<Value> {
        let exchange = async {
            let mut stream = TcpStream::connect((self.host.as_str(), self.port)).await?;
            stream
                .write_all(&encrypt(request.to_string().as_bytes()))
                .await?;

            let mut header = [0u8; 4];
            stream.read_exact(&mut header).await?;
            let len = u32::from_be_bytes(header) as usize;
            if len > MAX_RESPONSE_LEN {
                return Err(OutputError::ConnectionLost(format!(
                    "response of {len} bytes from {}",
                    self.host
                )));
            }
            let mut body = vec![0u8; len];
            stream.read_exact(&mut body).await?;
            Ok(serde_json::from_slice(&decrypt(&body))?)
        };

        match tokio::time::timeout(self.timeout, exchange).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(OutputError::ConnectionLost(format!(
                "{}:{}: {err}",
                self.host, self.port
            ))),
            Err(_) => Err(OutputError::ConnectionLost(format!(
                "{}:{} did not answer within {:?}",
                self.host, self.port, self.timeout
            ))),
        }
    }

    pub async fn sysinfo(&self) -> Result<SysInfo> {
        let response = self.request(&json!({"system": {"get_sysinfo": {}}})).await?;
        let parsed: SysInfoResponse = serde_json::from_value(response)?;
        Ok(parsed.system.get_sysinfo)
    }

    /// Switch the relay, optionally addressing one child outlet.
    pub async fn set_relay_state(&self, child_id: Option<&str>, on: bool) -> Result<()> {
        let mut request = json!({"system": {"set_relay_state": {"state": u8::from(on)}}});
        if let Some(child_id) = child_id {
            request["context"] = json!({ "child_ids": [child_id] });
        }
        let response = self.request(&request).await?;
        match response["system"]["set_relay_state"]["err_code"].as_i64() {
            Some(0) => Ok(()),
            code => Err(OutputError::command(
                0,
                format!("set_relay_state rejected with err_code {code:?}"),
            )),
        }
    }
}

/// Whether outlets are addressed through child ids.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KasaModel {
    /// Single relay, no children.
    Plug,
    /// Power strip, every outlet is a child. A relay command without a
    /// child id switches the whole strip.
    Strip,
}

/// Kasa plug or strip driven through [`KasaClient`].
pub struct KasaDevice {
    client: KasaClient,
    model: KasaModel,
    outlets: u8,
    child_ids: Vec<String>,
}

impl KasaDevice {
    /// * `outlets`: outlets in use, a strip may use fewer than it has.
    pub fn new(client: KasaClient, model: KasaModel, outlets: u8) -> Self {
        Self {
            client,
            model,
            outlets,
            child_ids: Vec::new(),
        }
    }

    fn is_strip(&self) -> bool {
        self.model == KasaModel::Strip
    }

    fn child_id(&self, channel: u8) -> Result<&str> {
        self.child_ids
            .get(usize::from(channel))
            .map(String::as_str)
            .ok_or_else(|| OutputError::Config(format!("strip has no outlet {channel}")))
    }
}

impl NetworkActuator for KasaDevice {
    async fn connect(&mut self) -> Result<String> {
        let info = self.client.sysinfo().await?;
        if self.is_strip() {
            if info.children.len() < usize::from(self.outlets) {
                return Err(OutputError::Setup(format!(
                    "{} reports {} outlets, {} configured",
                    info.alias,
                    info.children.len(),
                    self.outlets
                )));
            }
            self.child_ids = info.children.iter().map(|child| child.id.clone()).collect();
        }
        debug!(alias = %info.alias, model = %info.model, "connected to kasa device");
        Ok(format!("{} ({})", info.alias, info.model))
    }

    async fn set_state(&mut self, channel: u8, on: bool) -> Result<()> {
        let result = if self.is_strip() {
            let child_id = self.child_id(channel)?.to_owned();
            self.client.set_relay_state(Some(&child_id), on).await
        } else {
            self.client.set_relay_state(None, on).await
        };
        result.map_err(|err| match err {
            OutputError::Command { reason, .. } => OutputError::command(channel, reason),
            err => err,
        })
    }

    async fn query_states(&mut self) -> Result<Vec<bool>> {
        let info = self.client.sysinfo().await?;
        if self.is_strip() {
            Ok(info
                .children
                .iter()
                .take(usize::from(self.outlets))
                .map(|child| child.state == 1)
                .collect())
        } else {
            Ok(vec![info.relay_state == Some(1)])
        }
    }
}
