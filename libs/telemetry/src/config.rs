use std::env;

#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub service_name: String,
    pub json_logs: bool,
    /// Used when `RUST_LOG` is unset or unparsable.
    pub default_filter: String,
}

impl TelemetryConfig {
    pub fn from_env(default_service_name: &str) -> Self {
        Self::from_lookup(default_service_name, |key| env::var(key).ok())
    }

    pub fn from_lookup(
        default_service_name: &str,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Self {
        let service_name = lookup("SERVICE_NAME").unwrap_or_else(|| default_service_name.into());
        let json_logs = lookup("LOG_FORMAT")
            .map(|v| !matches!(v.to_lowercase().as_str(), "text" | "pretty" | "plain"))
            .unwrap_or(true);
        Self {
            service_name,
            json_logs,
            default_filter: "info".into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn json_is_the_default_format() {
        let cfg = TelemetryConfig::from_lookup("relay", lookup(&[]));
        assert!(cfg.json_logs);
        assert_eq!(cfg.service_name, "relay");
    }

    #[test]
    fn text_formats_disable_json() {
        for value in ["text", "Pretty", "PLAIN"] {
            let cfg = TelemetryConfig::from_lookup("relay", lookup(&[("LOG_FORMAT", value)]));
            assert!(!cfg.json_logs, "{value}");
        }
        let cfg = TelemetryConfig::from_lookup("relay", lookup(&[("LOG_FORMAT", "json")]));
        assert!(cfg.json_logs);
    }
}
