// src/api/signer.rs
//! Request signing for authenticated endpoints.
//!
//! Signers mutate the parameter list in place: they append whatever the
//! exchange expects (timestamp, receive window, signature) and expose the
//! headers that must travel with the signed call.

use crate::api::transport::encode_query;
use crate::config::ApiCredentials;
use crate::error::{GatewayError, Result};
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the API key on signed calls
pub const API_KEY_HEADER: &str = "X-MBX-APIKEY";

pub trait RequestSigner: Send + Sync {
    /// Append authentication parameters to `params`
    fn sign(&self, params: &mut Vec<(String, String)>, timestamp_ms: i64) -> Result<()>;

    /// Extra headers for signed calls
    fn headers(&self) -> Vec<(String, String)>;
}

/// Hex HMAC-SHA256 over the url-encoded parameter string, parameter order
/// preserved.
pub struct HmacSha256Signer {
    credentials: ApiCredentials,
    recv_window_ms: Option<u64>,
}

impl HmacSha256Signer {
    pub fn new(credentials: ApiCredentials) -> Self {
        Self {
            credentials,
            recv_window_ms: None,
        }
    }

    pub fn with_recv_window(mut self, recv_window_ms: u64) -> Self {
        self.recv_window_ms = Some(recv_window_ms);
        self
    }

    /// Sign a message and return the lowercase hex signature
    pub fn signature(&self, message: &str) -> Result<String> {
        let mut mac = HmacSha256::new_from_slice(self.credentials.expose_secret().as_bytes())
            .map_err(|e| GatewayError::Signing(e.to_string()))?;
        mac.update(message.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }
}

impl RequestSigner for HmacSha256Signer {
    fn sign(&self, params: &mut Vec<(String, String)>, timestamp_ms: i64) -> Result<()> {
        if params.iter().any(|(k, _)| k == "signature") {
            return Err(GatewayError::Signing("request is already signed".into()));
        }

        if let Some(window) = self.recv_window_ms {
            if !params.iter().any(|(k, _)| k == "recvWindow") {
                params.push(("recvWindow".to_string(), window.to_string()));
            }
        }
        params.retain(|(k, _)| k != "timestamp");
        params.push(("timestamp".to_string(), timestamp_ms.to_string()));

        let signature = self.signature(&encode_query(params))?;
        params.push(("signature".to_string(), signature));
        Ok(())
    }

    fn headers(&self) -> Vec<(String, String)> {
        vec![(API_KEY_HEADER.to_string(), self.credentials.api_key.clone())]
    }
}

impl std::fmt::Debug for HmacSha256Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HmacSha256Signer")
            .field("credentials", &self.credentials)
            .field("recv_window_ms", &self.recv_window_ms)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "NhqPtmdSJYdKjVHjA7PZj4Mge3R5YNiP1e3UZjInClVN65XAbvqqM6A7H5fATj0j";

    fn signer() -> HmacSha256Signer {
        HmacSha256Signer::new(ApiCredentials::new(
            "vmPUZE6mv9SD5VNHk4HlWFsOr6aKE2zvsw0MuIgwCIPy6utIco14y7Ju91duEh8A",
            SECRET,
        ))
    }

    #[test]
    fn test_sign_known_vector() {
        // Binance API documentation example
        let query = "symbol=LTCBTC&side=BUY&type=LIMIT&timeInForce=GTC&quantity=1&price=0.1&recvWindow=5000&timestamp=1499827319559";
        assert_eq!(
            signer().signature(query).unwrap(),
            "c8db56825ae71d6d79447849e617115f4a920fa2acdcab2b053c4b2838bd6b71"
        );
    }

    #[test]
    fn test_sign_params_matches_known_vector() {
        let mut params: Vec<(String, String)> = [
            ("symbol", "LTCBTC"),
            ("side", "BUY"),
            ("type", "LIMIT"),
            ("timeInForce", "GTC"),
            ("quantity", "1"),
            ("price", "0.1"),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        signer()
            .with_recv_window(5000)
            .sign(&mut params, 1_499_827_319_559)
            .unwrap();

        let last = params.last().unwrap();
        assert_eq!(last.0, "signature");
        assert_eq!(
            last.1,
            "c8db56825ae71d6d79447849e617115f4a920fa2acdcab2b053c4b2838bd6b71"
        );
        assert!(params.contains(&("timestamp".to_string(), "1499827319559".to_string())));
    }

    #[test]
    fn test_double_signing_is_rejected() {
        let s = signer();
        let mut params = vec![("symbol".to_string(), "BTCUSDT".to_string())];
        s.sign(&mut params, 1000).unwrap();
        assert!(s.sign(&mut params, 1001).is_err());
    }

    #[test]
    fn test_headers_and_redaction() {
        let s = signer();
        assert_eq!(s.headers()[0].0, API_KEY_HEADER);
        assert!(!format!("{:?}", s).contains(SECRET));
    }
}
