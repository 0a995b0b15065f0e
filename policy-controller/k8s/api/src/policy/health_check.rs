use super::{
    check_max_len, check_range, check_target, ConditionsStatus, InvalidSpec,
    PolicyTargetReference, BACKEND_TARGETS,
};
use once_cell::sync::Lazy;
use regex::Regex;

/// HealthCheckPolicy attaches a load balancer health check to a Service.
#[derive(
    Clone, Debug, kube::CustomResource, serde::Deserialize, serde::Serialize, schemars::JsonSchema,
)]
#[kube(
    group = "networking.gke.io",
    version = "v1",
    kind = "HealthCheckPolicy",
    status = "ConditionsStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckPolicySpec {
    pub target_ref: PolicyTargetReference,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<HealthCheckPolicyConfig>,
}

#[derive(Clone, Debug, Default, serde::Deserialize, serde::Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckPolicyConfig {
    /// Seconds between checks. Defaults to 5.
    pub check_interval_sec: Option<i64>,

    /// Seconds to wait before claiming failure. Defaults to 5 and must not
    /// exceed `checkIntervalSec`.
    pub timeout_sec: Option<i64>,

    pub unhealthy_threshold: Option<i64>,
    pub healthy_threshold: Option<i64>,

    /// Per-protocol check configuration. Defaults to an HTTP check.
    ///
    /// Kept in its wire form so that a malformed union surfaces through
    /// [`HealthCheckPolicyConfig::validate`] rather than failing to decode.
    pub config: Option<HealthCheckFields>,

    pub log_config: Option<LogConfig>,
}

#[derive(
    Clone, Debug, Default, PartialEq, serde::Deserialize, serde::Serialize, schemars::JsonSchema,
)]
#[serde(rename_all = "camelCase")]
pub struct LogConfig {
    pub enabled: Option<bool>,
}

/// A protocol-specific health check. Exactly one payload exists and it always
/// matches the `type` discriminator of its [`HealthCheckFields`].
#[derive(Clone, Debug, PartialEq)]
pub enum HealthCheck {
    Tcp(TcpHealthCheck),
    Http(HttpHealthCheck),
    Https(HttpHealthCheck),
    Http2(HttpHealthCheck),
    Grpc(GrpcHealthCheck),
}

#[derive(
    Copy, Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize, schemars::JsonSchema,
)]
pub enum HealthCheckType {
    #[serde(rename = "TCP")]
    Tcp,
    #[serde(rename = "HTTP")]
    Http,
    #[serde(rename = "HTTPS")]
    Https,
    #[serde(rename = "HTTP2")]
    Http2,
    #[serde(rename = "GRPC")]
    Grpc,
}

#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum HealthCheckError {
    #[error("health check type must be specified")]
    MissingType,

    #[error("{0:?} health check requires its protocol configuration")]
    MissingConfig(HealthCheckType),

    #[error("exactly one protocol configuration may be specified, got {0}")]
    MultipleConfigs(usize),

    #[error("health check type is {declared:?} but {found:?} configuration was given")]
    Mismatch {
        declared: HealthCheckType,
        found: HealthCheckType,
    },
}

/// The wire form of [`HealthCheck`]: a discriminator and one optional field
/// per protocol.
#[derive(
    Clone, Debug, Default, PartialEq, serde::Deserialize, serde::Serialize, schemars::JsonSchema,
)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckFields {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub type_: Option<HealthCheckType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp_health_check: Option<TcpHealthCheck>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_health_check: Option<HttpHealthCheck>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub https_health_check: Option<HttpHealthCheck>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http2_health_check: Option<HttpHealthCheck>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grpc_health_check: Option<GrpcHealthCheck>,
}

#[derive(
    Clone, Debug, Default, PartialEq, serde::Deserialize, serde::Serialize, schemars::JsonSchema,
)]
#[serde(rename_all = "camelCase")]
pub struct CommonHealthCheck {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port_specification: Option<PortSpecification>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port_name: Option<String>,
}

#[derive(
    Copy, Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize, schemars::JsonSchema,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PortSpecification {
    UseFixedPort,
    UseNamedPort,
    UseServingPort,
}

#[derive(
    Copy, Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize, schemars::JsonSchema,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyHeader {
    None,
    ProxyV1,
}

#[derive(
    Clone, Debug, Default, PartialEq, serde::Deserialize, serde::Serialize, schemars::JsonSchema,
)]
#[serde(rename_all = "camelCase")]
pub struct TcpHealthCheck {
    #[serde(flatten)]
    pub common: CommonHealthCheck,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_header: Option<ProxyHeader>,
}

/// Shared by the HTTP, HTTPS and HTTP2 health checks.
#[derive(
    Clone, Debug, Default, PartialEq, serde::Deserialize, serde::Serialize, schemars::JsonSchema,
)]
#[serde(rename_all = "camelCase")]
pub struct HttpHealthCheck {
    #[serde(flatten)]
    pub common: CommonHealthCheck,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_header: Option<ProxyHeader>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
}

#[derive(
    Clone, Debug, Default, PartialEq, serde::Deserialize, serde::Serialize, schemars::JsonSchema,
)]
#[serde(rename_all = "camelCase")]
pub struct GrpcHealthCheck {
    #[serde(flatten)]
    pub common: CommonHealthCheck,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grpc_service_name: Option<String>,
}

const DEFAULT_CHECK_INTERVAL_SEC: i64 = 5;
const DEFAULT_TIMEOUT_SEC: i64 = 5;

static PORT_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z]([-a-z0-9]*[a-z0-9])?$").expect("port name regex"));
static HOST: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*$")
        .expect("host regex")
});
static REQUEST_PATH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^/[A-Za-z0-9/\-._~%!?$&'()*+,;=:]*$").expect("request path regex")
});

// === impl HealthCheckPolicySpec ===

impl HealthCheckPolicySpec {
    pub fn validate(&self) -> Result<(), InvalidSpec> {
        check_target(&self.target_ref, BACKEND_TARGETS, "Service or ServiceImport")?;
        match self.default.as_ref() {
            Some(config) => config.validate(),
            None => Ok(()),
        }
    }
}

impl HealthCheckPolicyConfig {
    pub fn validate(&self) -> Result<(), InvalidSpec> {
        check_range("checkIntervalSec", self.check_interval_sec, 1, 300)?;
        check_range("timeoutSec", self.timeout_sec, 1, 300)?;
        check_range("unhealthyThreshold", self.unhealthy_threshold, 1, 10)?;
        check_range("healthyThreshold", self.healthy_threshold, 1, 10)?;

        let interval = self
            .check_interval_sec
            .unwrap_or(DEFAULT_CHECK_INTERVAL_SEC);
        let timeout = self.timeout_sec.unwrap_or(DEFAULT_TIMEOUT_SEC);
        if timeout > interval {
            return Err(InvalidSpec::TimeoutExceedsInterval { timeout, interval });
        }

        match self.config.as_ref() {
            Some(fields) => fields.health_check()?.validate(),
            None => Ok(()),
        }
    }
}

// === impl HealthCheck ===

impl HealthCheck {
    pub fn type_(&self) -> HealthCheckType {
        match self {
            Self::Tcp(_) => HealthCheckType::Tcp,
            Self::Http(_) => HealthCheckType::Http,
            Self::Https(_) => HealthCheckType::Https,
            Self::Http2(_) => HealthCheckType::Http2,
            Self::Grpc(_) => HealthCheckType::Grpc,
        }
    }

    pub fn common(&self) -> &CommonHealthCheck {
        match self {
            Self::Tcp(tcp) => &tcp.common,
            Self::Http(http) | Self::Https(http) | Self::Http2(http) => &http.common,
            Self::Grpc(grpc) => &grpc.common,
        }
    }

    pub fn validate(&self) -> Result<(), InvalidSpec> {
        self.common().validate()?;
        match self {
            Self::Tcp(tcp) => {
                check_ascii("request", tcp.request.as_deref(), 1024)?;
                check_ascii("response", tcp.response.as_deref(), 1024)
            }
            Self::Http(http) | Self::Https(http) | Self::Http2(http) => http.validate(),
            Self::Grpc(grpc) => check_ascii(
                "grpcServiceName",
                grpc.grpc_service_name.as_deref(),
                1024,
            ),
        }
    }
}

impl TryFrom<HealthCheckFields> for HealthCheck {
    type Error = HealthCheckError;

    fn try_from(fields: HealthCheckFields) -> Result<Self, Self::Error> {
        let HealthCheckFields {
            type_,
            tcp_health_check,
            http_health_check,
            https_health_check,
            http2_health_check,
            grpc_health_check,
        } = fields;

        let mut given = Vec::with_capacity(1);
        if let Some(tcp) = tcp_health_check {
            given.push(Self::Tcp(tcp));
        }
        if let Some(http) = http_health_check {
            given.push(Self::Http(http));
        }
        if let Some(https) = https_health_check {
            given.push(Self::Https(https));
        }
        if let Some(http2) = http2_health_check {
            given.push(Self::Http2(http2));
        }
        if let Some(grpc) = grpc_health_check {
            given.push(Self::Grpc(grpc));
        }

        let declared = type_.ok_or(HealthCheckError::MissingType)?;
        if given.len() > 1 {
            return Err(HealthCheckError::MultipleConfigs(given.len()));
        }
        let hc = given
            .pop()
            .ok_or(HealthCheckError::MissingConfig(declared))?;
        if hc.type_() != declared {
            return Err(HealthCheckError::Mismatch {
                declared,
                found: hc.type_(),
            });
        }
        Ok(hc)
    }
}

impl From<HealthCheck> for HealthCheckFields {
    fn from(hc: HealthCheck) -> Self {
        let mut fields = HealthCheckFields {
            type_: Some(hc.type_()),
            ..Default::default()
        };
        match hc {
            HealthCheck::Tcp(tcp) => fields.tcp_health_check = Some(tcp),
            HealthCheck::Http(http) => fields.http_health_check = Some(http),
            HealthCheck::Https(https) => fields.https_health_check = Some(https),
            HealthCheck::Http2(http2) => fields.http2_health_check = Some(http2),
            HealthCheck::Grpc(grpc) => fields.grpc_health_check = Some(grpc),
        }
        fields
    }
}

impl HealthCheckFields {
    /// Resolves the discriminated union.
    pub fn health_check(&self) -> Result<HealthCheck, HealthCheckError> {
        HealthCheck::try_from(self.clone())
    }
}

// === impl CommonHealthCheck ===

impl CommonHealthCheck {
    pub fn validate(&self) -> Result<(), InvalidSpec> {
        check_range("port", self.port, 1, 65535)?;
        if let Some(name) = self.port_name.as_deref() {
            check_max_len("portName", Some(name), 63)?;
            if !PORT_NAME.is_match(name) {
                return Err(InvalidSpec::Malformed {
                    field: "portName",
                    reason: "must be a lowercase DNS label",
                });
            }
        }

        match self.port_specification {
            Some(PortSpecification::UseFixedPort) if self.port.is_none() => {
                Err(InvalidSpec::Malformed {
                    field: "portSpecification",
                    reason: "USE_FIXED_PORT requires port",
                })
            }
            Some(PortSpecification::UseNamedPort) if self.port_name.is_none() => {
                Err(InvalidSpec::Malformed {
                    field: "portSpecification",
                    reason: "USE_NAMED_PORT requires portName",
                })
            }
            Some(PortSpecification::UseServingPort)
                if self.port.is_some() || self.port_name.is_some() =>
            {
                Err(InvalidSpec::Malformed {
                    field: "portSpecification",
                    reason: "USE_SERVING_PORT must not set port or portName",
                })
            }
            _ => Ok(()),
        }
    }
}

impl HttpHealthCheck {
    fn validate(&self) -> Result<(), InvalidSpec> {
        if let Some(host) = self.host.as_deref().filter(|h| !h.is_empty()) {
            check_max_len("host", Some(host), 2048)?;
            if !HOST.is_match(host) || host.parse::<std::net::IpAddr>().is_ok() {
                return Err(InvalidSpec::Malformed {
                    field: "host",
                    reason: "must be an RFC 1123 hostname",
                });
            }
        }
        if let Some(path) = self.request_path.as_deref().filter(|p| !p.is_empty()) {
            check_max_len("requestPath", Some(path), 2048)?;
            if !REQUEST_PATH.is_match(path) {
                return Err(InvalidSpec::Malformed {
                    field: "requestPath",
                    reason: "must be an absolute URL path",
                });
            }
        }
        check_ascii("response", self.response.as_deref(), 1024)
    }
}

fn check_ascii(field: &'static str, value: Option<&str>, max: usize) -> Result<(), InvalidSpec> {
    check_max_len(field, value, max)?;
    match value {
        Some(v) if !v.is_ascii() => Err(InvalidSpec::Malformed {
            field,
            reason: "must only contain ASCII characters",
        }),
        _ => Ok(()),
    }
}
