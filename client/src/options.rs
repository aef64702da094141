// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Connection parameters, built with a setter-returning-`&mut Self` builder
//! in the same style as `ruo`'s `ConnectOptions`.

use std::net::SocketAddr;
use std::time::Duration;

use mqtt_codec::{random_string, QoS};

use crate::error::{Error, ErrorKind};
use crate::reconnect::ReconnectPolicy;

/// Trust configuration for a TLS connection.
///
/// With no `ca_cert_path`, the standard webpki CA bundle is used, which
/// covers the common case of a broker with a publicly-trusted
/// certificate. Client-certificate auth is left to the application to
/// build from `tokio_rustls::rustls` types directly, same as spec.md's
/// Non-goal on advanced broker-side TLS policy.
#[derive(Clone, Debug)]
pub struct TlsConfig {
    /// Server name used for the TLS handshake's SNI and certificate
    /// verification; usually the broker's hostname.
    pub server_name: String,
    /// PEM-encoded CA certificate file to trust in addition to the
    /// webpki root store, for brokers using a private or self-signed CA.
    pub ca_cert_path: Option<std::path::PathBuf>,
}

impl TlsConfig {
    #[must_use]
    pub fn new(server_name: impl Into<String>) -> Self {
        Self {
            server_name: server_name.into(),
            ca_cert_path: None,
        }
    }

    #[must_use]
    pub fn with_ca_cert(mut self, path: impl Into<std::path::PathBuf>) -> Self {
        self.ca_cert_path = Some(path.into());
        self
    }
}

#[derive(Clone, Debug)]
struct Will {
    topic: String,
    payload: Vec<u8>,
    qos: QoS,
    retain: bool,
}

#[derive(Clone, Debug)]
struct Credentials {
    username: String,
    password: Option<Vec<u8>>,
}

/// Everything needed to open and maintain one MQTT connection.
///
/// Construct with [`ConnectOptions::builder`], which returns a
/// [`ConnectOptionsBuilder`]; call [`ConnectOptionsBuilder::build`] to get the
/// immutable value the connection actually uses.
#[derive(Clone, Debug)]
pub struct ConnectOptions {
    address: SocketAddr,
    tls: Option<TlsConfig>,
    client_id: String,
    clean_session: bool,
    keep_alive_secs: u16,
    request_timeout: Duration,
    will: Option<Will>,
    credentials: Option<Credentials>,
    reconnect_policy: ReconnectPolicy,
}

impl ConnectOptions {
    #[must_use]
    pub fn builder(address: SocketAddr) -> ConnectOptionsBuilder {
        ConnectOptionsBuilder {
            address,
            tls: None,
            client_id: None,
            clean_session: true,
            keep_alive_secs: 60,
            request_timeout: Duration::from_secs(10),
            will: None,
            credentials: None,
            reconnect_policy: ReconnectPolicy::default(),
        }
    }

    #[must_use]
    pub const fn address(&self) -> SocketAddr {
        self.address
    }

    #[must_use]
    pub fn tls(&self) -> Option<&TlsConfig> {
        self.tls.as_ref()
    }

    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    #[must_use]
    pub const fn clean_session(&self) -> bool {
        self.clean_session
    }

    #[must_use]
    pub const fn keep_alive_secs(&self) -> u16 {
        self.keep_alive_secs
    }

    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    #[must_use]
    pub const fn reconnect_policy(&self) -> &ReconnectPolicy {
        &self.reconnect_policy
    }

    pub(crate) fn will(&self) -> Option<(&str, &[u8], QoS, bool)> {
        self.will
            .as_ref()
            .map(|w| (w.topic.as_str(), w.payload.as_slice(), w.qos, w.retain))
    }

    pub(crate) fn credentials(&self) -> Option<(&str, Option<&[u8]>)> {
        self.credentials
            .as_ref()
            .map(|c| (c.username.as_str(), c.password.as_deref()))
    }
}

/// Builder for [`ConnectOptions`].
pub struct ConnectOptionsBuilder {
    address: SocketAddr,
    tls: Option<TlsConfig>,
    client_id: Option<String>,
    clean_session: bool,
    keep_alive_secs: u16,
    request_timeout: Duration,
    will: Option<Will>,
    credentials: Option<Credentials>,
    reconnect_policy: ReconnectPolicy,
}

impl ConnectOptionsBuilder {
    #[must_use]
    pub fn tls(mut self, tls: TlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    #[must_use]
    pub fn client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    #[must_use]
    pub fn clean_session(mut self, clean_session: bool) -> Self {
        self.clean_session = clean_session;
        self
    }

    #[must_use]
    pub fn keep_alive_secs(mut self, keep_alive_secs: u16) -> Self {
        self.keep_alive_secs = keep_alive_secs;
        self
    }

    #[must_use]
    pub fn request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    #[must_use]
    pub fn will(mut self, topic: impl Into<String>, payload: &[u8], qos: QoS, retain: bool) -> Self {
        self.will = Some(Will {
            topic: topic.into(),
            payload: payload.to_vec(),
            qos,
            retain,
        });
        self
    }

    #[must_use]
    pub fn credentials(mut self, username: impl Into<String>, password: Option<&[u8]>) -> Self {
        self.credentials = Some(Credentials {
            username: username.into(),
            password: password.map(<[u8]>::to_vec),
        });
        self
    }

    #[must_use]
    pub fn reconnect_policy(mut self, reconnect_policy: ReconnectPolicy) -> Self {
        self.reconnect_policy = reconnect_policy;
        self
    }

    /// # Errors
    ///
    /// Returns error if a password was set without an accompanying username.
    pub fn build(self) -> Result<ConnectOptions, Error> {
        let keep_alive_secs = mqtt_codec::validate_keep_alive(self.keep_alive_secs);

        if self
            .credentials
            .as_ref()
            .is_some_and(|c| c.password.is_some() && c.username.is_empty())
        {
            return Err(Error::new(
                ErrorKind::InvalidTopic,
                "password set without a username",
            ));
        }

        let client_id = self
            .client_id
            .unwrap_or_else(|| format!("mqtt-client-{}", random_string(8)));

        Ok(ConnectOptions {
            address: self.address,
            tls: self.tls,
            client_id,
            clean_session: self.clean_session,
            keep_alive_secs,
            request_timeout: self.request_timeout,
            will: self.will,
            credentials: self.credentials,
            reconnect_policy: self.reconnect_policy,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:1883".parse().unwrap()
    }

    #[test]
    fn default_client_id_is_generated_when_unset() {
        let options = ConnectOptions::builder(addr()).build().unwrap();
        assert!(options.client_id().starts_with("mqtt-client-"));
    }

    #[test]
    fn explicit_client_id_is_kept() {
        let options = ConnectOptions::builder(addr())
            .client_id("device-42")
            .build()
            .unwrap();
        assert_eq!(options.client_id(), "device-42");
    }

    #[test]
    fn password_without_username_is_rejected() {
        let result = ConnectOptions::builder(addr())
            .credentials(String::new(), Some(b"secret"))
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn will_and_credentials_round_trip() {
        let options = ConnectOptions::builder(addr())
            .will("clients/42/lwt", b"offline", QoS::AtLeastOnce, true)
            .credentials("alice", Some(b"secret"))
            .build()
            .unwrap();
        let (topic, payload, qos, retain) = options.will().unwrap();
        assert_eq!(topic, "clients/42/lwt");
        assert_eq!(payload, b"offline");
        assert_eq!(qos, QoS::AtLeastOnce);
        assert!(retain);

        let (username, password) = options.credentials().unwrap();
        assert_eq!(username, "alice");
        assert_eq!(password, Some(b"secret".as_slice()));
    }
}
