//! HTTP client for the external tokenizer service.
//!
//! The service owns the conversation template and the already-seen context
//! per session ("uid"). A stale uid is rejected with a 400 naming
//! "Invalid uid"; the client transparently acquires a fresh uid and retries
//! the request once.

use std::time::Duration;

use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{LlmError, Result};
use crate::tokenizer::{Encoded, Tokenizer};

#[derive(Deserialize)]
struct UidReply {
    uid: String,
}

#[derive(Deserialize)]
struct BosReply {
    bos_id: u32,
}

#[derive(Deserialize)]
struct EosReply {
    eos_id: u32,
}

#[derive(Serialize)]
struct ResetRequest<'a> {
    uid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_prompt: Option<&'a str>,
}

#[derive(Deserialize)]
struct ResetReply {
    token_ids: Vec<u32>,
}

#[derive(Serialize)]
struct EncodeRequest<'a> {
    uid: String,
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_reply: Option<&'a str>,
    img_prompt: bool,
}

#[derive(Deserialize)]
struct EncodeReply {
    token_ids: Vec<u32>,
    diff: Vec<u32>,
}

#[derive(Serialize)]
struct DecodeRequest<'a> {
    uid: String,
    token_ids: &'a [u32],
}

#[derive(Deserialize)]
struct DecodeReply {
    text: String,
}

pub struct HttpTokenizer {
    client: Client,
    base_url: String,
    tokenizer_type: String,
    uid: String,
    bos: u32,
    eos: u32,
}

impl HttpTokenizer {
    /// Connect to the service, acquire a session uid and query the special
    /// token ids.
    pub fn connect(base_url: &str, tokenizer_type: &str) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| LlmError::tokenizer(format!("http client: {e}")))?;
        let mut this = Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            tokenizer_type: tokenizer_type.to_string(),
            uid: String::new(),
            bos: 0,
            eos: 0,
        };
        this.acquire_uid()?;
        this.bos = this.get_json::<BosReply>("bos_id")?.bos_id;
        this.eos = this.get_json::<EosReply>("eos_id")?.eos_id;
        info!(bos = this.bos, eos = this.eos, "tokenizer service connected");
        Ok(this)
    }

    fn acquire_uid(&mut self) -> Result<()> {
        let url = format!(
            "{}/get_uid?tokenizer_type={}",
            self.base_url, self.tokenizer_type
        );
        let reply = self
            .client
            .get(&url)
            .send()
            .and_then(|r| r.error_for_status())
            .map_err(|e| LlmError::tokenizer(format!("get_uid: {e}")))?;
        let uid: UidReply = reply
            .json()
            .map_err(|e| LlmError::tokenizer(format!("get_uid body: {e}")))?;
        self.uid = uid.uid;
        info!(uid = %self.uid, "tokenizer uid acquired");
        Ok(())
    }

    fn get_json<T: for<'de> Deserialize<'de>>(&self, endpoint: &str) -> Result<T> {
        let url = format!("{}/{endpoint}?uid={}", self.base_url, self.uid);
        self.client
            .get(&url)
            .send()
            .and_then(|r| r.error_for_status())
            .and_then(|r| r.json())
            .map_err(|e| LlmError::tokenizer(format!("{endpoint}: {e}")))
    }

    /// POST a JSON body; on an invalid-uid rejection, re-acquire the uid
    /// and retry once.
    fn post_json<B: Serialize, T: for<'de> Deserialize<'de>>(
        &mut self,
        endpoint: &str,
        build: impl Fn(String) -> B,
    ) -> Result<T> {
        for attempt in 0..2 {
            let url = format!("{}/{endpoint}", self.base_url);
            let body = build(self.uid.clone());
            let reply = self
                .client
                .post(&url)
                .json(&body)
                .send()
                .map_err(|e| LlmError::tokenizer(format!("{endpoint}: {e}")))?;
            let status = reply.status();
            if status == reqwest::StatusCode::BAD_REQUEST {
                let text = reply.text().unwrap_or_default();
                if text.contains("Invalid uid") && attempt == 0 {
                    warn!(endpoint, "tokenizer uid invalidated, re-acquiring");
                    self.acquire_uid()?;
                    continue;
                }
                return Err(LlmError::tokenizer(format!("{endpoint}: 400 {text}")));
            }
            if !status.is_success() {
                return Err(LlmError::tokenizer(format!("{endpoint}: status {status}")));
            }
            return reply
                .json()
                .map_err(|e| LlmError::tokenizer(format!("{endpoint} body: {e}")));
        }
        Err(LlmError::tokenizer(format!("{endpoint}: uid retry failed")))
    }
}

impl Tokenizer for HttpTokenizer {
    fn reset(&mut self, system_prompt: &str) -> Result<Vec<u32>> {
        let prompt = (!system_prompt.is_empty()).then_some(system_prompt);
        let reply: ResetReply = self.post_json("reset", |uid| ResetRequest {
            uid,
            system_prompt: prompt,
        })?;
        Ok(reply.token_ids)
    }

    fn encode(&mut self, text: &str, last_reply: &str, img_prompt: bool) -> Result<Encoded> {
        let last = (!last_reply.is_empty()).then_some(last_reply);
        let reply: EncodeReply = self.post_json("encode", |uid| EncodeRequest {
            uid,
            text,
            last_reply: last,
            img_prompt,
        })?;
        Ok(Encoded {
            token_ids: reply.token_ids,
            diff: reply.diff,
        })
    }

    fn decode(&mut self, token_ids: &[u32]) -> Result<String> {
        let reply: DecodeReply =
            self.post_json("decode", |uid| DecodeRequest { uid, token_ids })?;
        Ok(reply.text)
    }

    fn bos_id(&self) -> u32 {
        self.bos
    }

    fn eos_id(&self) -> u32 {
        self.eos
    }
}
