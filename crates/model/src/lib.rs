use std::{
    error::Error,
    fmt::{self, Display},
    net::{IpAddr, Ipv6Addr, SocketAddr},
    str::FromStr,
    sync::Arc,
};

use serde::{de, Deserialize, Deserializer};

/// A `host:port` pair that the relay either listens on or dials.
///
/// The host is kept unresolved so that a hostname upstream is looked up at
/// dial time instead of once at startup.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: Arc<str>,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<Arc<str>>, port: u16) -> Self {
        Endpoint {
            host: host.into(),
            port,
        }
    }

    /// Address in the form accepted by [`std::net::ToSocketAddrs`] and
    /// `tokio::net::TcpStream::connect`.
    pub fn addr(&self) -> (&str, u16) {
        (&self.host, self.port)
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(value: SocketAddr) -> Self {
        Endpoint {
            host: Arc::from(value.ip().to_string()),
            port: value.port(),
        }
    }
}

impl Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointParseError {
    MissingPort,
    EmptyHost,
    InvalidHost(String),
    InvalidPort(String),
}

impl Display for EndpointParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointParseError::MissingPort => write!(f, "endpoint is missing a `:port` suffix"),
            EndpointParseError::EmptyHost => write!(f, "endpoint host is empty"),
            EndpointParseError::InvalidHost(host) => write!(f, "invalid host `{host}`"),
            EndpointParseError::InvalidPort(port) => write!(f, "invalid port `{port}`"),
        }
    }
}

impl Error for EndpointParseError {}

impl FromStr for Endpoint {
    type Err = EndpointParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(addr) = s.parse::<SocketAddr>() {
            return Ok(addr.into());
        }

        if s.parse::<IpAddr>().is_ok() {
            return Err(EndpointParseError::MissingPort);
        }

        let (host, port) = s.rsplit_once(':').ok_or(EndpointParseError::MissingPort)?;

        let host = match host.strip_prefix('[') {
            Some(bracketed) => match bracketed.strip_suffix(']') {
                Some(inner) if inner.parse::<Ipv6Addr>().is_ok() => inner,
                _ => return Err(EndpointParseError::InvalidHost(host.to_owned())),
            },
            None => host,
        };
        if host.is_empty() {
            return Err(EndpointParseError::EmptyHost);
        }
        // Only bracketed IPv6 literals may contain a colon or brackets
        if !s.starts_with('[') && host.contains([':', '[', ']']) {
            return Err(EndpointParseError::InvalidHost(host.to_owned()));
        }

        let port = port
            .parse::<u16>()
            .map_err(|_| EndpointParseError::InvalidPort(port.to_owned()))?;

        Ok(Endpoint::new(host, port))
    }
}

impl<'de> Deserialize<'de> for Endpoint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(de::Error::custom)
    }
}

#[cfg(feature = "schemars")]
impl schemars::JsonSchema for Endpoint {
    fn schema_name() -> String {
        "Endpoint".to_owned()
    }

    fn json_schema(gen: &mut schemars::gen::SchemaGenerator) -> schemars::schema::Schema {
        let mut schema = <String as schemars::JsonSchema>::json_schema(gen).into_object();
        schema.metadata().description = Some("A `host:port` pair".to_owned());
        schema.into()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_ip_and_hostname() {
        assert_eq!(
            "127.0.0.1:8000".parse::<Endpoint>(),
            Ok(Endpoint::new("127.0.0.1", 8000))
        );
        assert_eq!(
            "upstream.internal:443".parse::<Endpoint>(),
            Ok(Endpoint::new("upstream.internal", 443))
        );
    }

    #[test]
    fn ipv6_is_bracketed_on_display() {
        let endpoint: Endpoint = "[::1]:9000".parse().unwrap();
        assert_eq!(&*endpoint.host, "::1");
        assert_eq!(endpoint.to_string(), "[::1]:9000");
    }

    #[test]
    fn rejects_malformed() {
        assert_eq!(
            "localhost".parse::<Endpoint>(),
            Err(EndpointParseError::MissingPort)
        );
        assert_eq!(":80".parse::<Endpoint>(), Err(EndpointParseError::EmptyHost));
        assert_eq!(
            "localhost:http".parse::<Endpoint>(),
            Err(EndpointParseError::InvalidPort("http".to_owned()))
        );
        assert_eq!(
            "localhost:70000".parse::<Endpoint>(),
            Err(EndpointParseError::InvalidPort("70000".to_owned()))
        );
        assert_eq!("::1".parse::<Endpoint>(), Err(EndpointParseError::MissingPort));
    }

    #[test]
    fn brackets_are_only_for_ipv6() {
        assert_eq!(
            "[foo]:80".parse::<Endpoint>(),
            Err(EndpointParseError::InvalidHost("[foo]".to_owned()))
        );
        assert_eq!(
            "a:b:80".parse::<Endpoint>(),
            Err(EndpointParseError::InvalidHost("a:b".to_owned()))
        );
        assert_eq!(
            "[::1:80".parse::<Endpoint>(),
            Err(EndpointParseError::InvalidHost("[::1".to_owned()))
        );
        assert_eq!(
            "[::1]:http".parse::<Endpoint>(),
            Err(EndpointParseError::InvalidPort("http".to_owned()))
        );
    }

    #[test]
    fn deserializes_from_string() {
        #[derive(Deserialize)]
        struct Wrapper {
            upstream: Endpoint,
        }

        let wrapper: Wrapper = toml::from_str(r#"upstream = "10.0.0.2:8000""#).unwrap();
        assert_eq!(wrapper.upstream, Endpoint::new("10.0.0.2", 8000));

        assert!(toml::from_str::<Wrapper>(r#"upstream = "10.0.0.2""#).is_err());
    }
}
