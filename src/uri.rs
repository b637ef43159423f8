//! DiameterURI parsing (RFC 6733 Section 4.3.1)
//!
//! Accepts URIs of the form `aaa://fqdn[:port][;transport=tcp|sctp]`.
//! The port defaults to 3868 and the transport to TCP. The `aaas` scheme
//! is recognized but rejected, since secure transports are not provided.

use std::str::FromStr;

use crate::error::DiameterError;
use crate::transport::TransportKind;
use crate::DIAMETER_PORT;

/// A parsed DiameterURI
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiameterUri {
    /// Peer FQDN (its DiameterIdentity)
    pub fqdn: String,
    /// Port, default 3868
    pub port: u16,
    /// Transport, default TCP
    pub transport: TransportKind,
}

impl FromStr for DiameterUri {
    type Err = DiameterError;

    fn from_str(uri: &str) -> Result<Self, Self::Err> {
        let (scheme, rest) = uri
            .split_once("://")
            .ok_or_else(|| DiameterError::InvalidUri(format!("{uri}: missing scheme")))?;
        match scheme {
            "aaa" => {}
            "aaas" => {
                return Err(DiameterError::InvalidUri(format!(
                    "{uri}: secure transport is not supported"
                )))
            }
            other => {
                return Err(DiameterError::InvalidUri(format!(
                    "{uri}: unknown scheme {other}"
                )))
            }
        }

        let (authority, params) = match rest.split_once(';') {
            Some((a, p)) => (a, p),
            None => (rest, ""),
        };

        let (fqdn, port) = match authority.split_once(':') {
            Some((host, port)) => {
                let port: u16 = port.parse().map_err(|_| {
                    DiameterError::InvalidUri(format!("{uri}: invalid port {port}"))
                })?;
                (host, port)
            }
            None => (authority, DIAMETER_PORT),
        };
        if fqdn.is_empty() {
            return Err(DiameterError::InvalidUri(format!("{uri}: empty fqdn")));
        }

        let mut transport = TransportKind::Tcp;
        for param in params.split(';').filter(|p| !p.is_empty()) {
            let Some((key, value)) = param.split_once('=') else {
                continue;
            };
            if key.eq_ignore_ascii_case("transport") {
                transport = match value.to_ascii_lowercase().as_str() {
                    "tcp" => TransportKind::Tcp,
                    "sctp" => TransportKind::Sctp,
                    other => {
                        return Err(DiameterError::InvalidUri(format!(
                            "{uri}: unknown transport {other}"
                        )))
                    }
                };
            }
        }

        Ok(DiameterUri {
            fqdn: fqdn.to_ascii_lowercase(),
            port,
            transport,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_defaults() {
        let uri: DiameterUri = "aaa://dra1.example.net".parse().unwrap();
        assert_eq!(uri.fqdn, "dra1.example.net");
        assert_eq!(uri.port, 3868);
        assert_eq!(uri.transport, TransportKind::Tcp);
    }

    #[test]
    fn test_parse_port_and_transport() {
        let uri: DiameterUri = "aaa://dra2.example.net:3869;transport=sctp".parse().unwrap();
        assert_eq!(uri.fqdn, "dra2.example.net");
        assert_eq!(uri.port, 3869);
        assert_eq!(uri.transport, TransportKind::Sctp);
    }

    #[test]
    fn test_parse_extra_params_ignored() {
        let uri: DiameterUri = "aaa://h.example;transport=tcp;protocol=diameter"
            .parse()
            .unwrap();
        assert_eq!(uri.transport, TransportKind::Tcp);
    }

    #[test]
    fn test_fqdn_lowercased() {
        let uri: DiameterUri = "aaa://DRA.Example.NET".parse().unwrap();
        assert_eq!(uri.fqdn, "dra.example.net");
    }

    #[test]
    fn test_parse_errors() {
        assert!("dra.example.net".parse::<DiameterUri>().is_err());
        assert!("aaas://dra.example.net".parse::<DiameterUri>().is_err());
        assert!("aaa://dra.example.net:notaport".parse::<DiameterUri>().is_err());
        assert!("aaa://h;transport=udp".parse::<DiameterUri>().is_err());
        assert!("aaa://".parse::<DiameterUri>().is_err());
    }
}
