//! Parsing of tunable parameter structs from optional TOML strings.

/// Builds a `$config_type` from its `Default`, then overrides the listed
/// fields with values parsed from the TOML string, if one is given. Keys not
/// in the field list are rejected with `ErrCode::Inval` before any value is
/// applied; a value of the wrong type fails the whole parse.
///
/// Example:
/// ```no_compile
/// let config = parsed_config!(config_str => TxConfig;
///                             inline_limit, rpc_timeout_ms)?;
/// ```
#[macro_export]
macro_rules! parsed_config {
    ($config_str:expr => $config_type:ty; $($field:ident),+) => {{
        let config_str: Option<&str> = $config_str;
        let known: &[&str] = &[$(stringify!($field)),+];

        let compose_config = || -> Result<$config_type, $crate::ShardTxError> {
            let mut config: $config_type = Default::default();
            let Some(config_str) = config_str else {
                return Ok(config);
            };

            let mut table = config_str.parse::<toml::Table>()?;
            let unknown: Vec<&String> = table
                .keys()
                .filter(|k| !known.contains(&k.as_str()))
                .collect();
            if !unknown.is_empty() {
                return Err($crate::ShardTxError::code(
                    $crate::ErrCode::Inval,
                    format!("unknown config keys {:?}", unknown),
                ));
            }

            $(
                if let Some(v) = table.remove(stringify!($field)) {
                    config.$field = v.try_into()?;
                }
            )+
            Ok(config)
        };

        compose_config()
    }};
}

#[cfg(test)]
mod config_tests {
    use crate::utils::{ErrCode, ShardTxError};

    #[derive(Debug, PartialEq)]
    struct RetryKnobs {
        max_us: u64,
        factor: u32,
        label: String,
    }

    impl Default for RetryKnobs {
        fn default() -> Self {
            RetryKnobs {
                max_us: 4_096_000,
                factor: 4,
                label: "cont".into(),
            }
        }
    }

    #[test]
    fn defaults_without_string() -> Result<(), ShardTxError> {
        let knobs = parsed_config!(None => RetryKnobs; max_us, factor, label)?;
        assert_eq!(knobs, RetryKnobs::default());
        Ok(())
    }

    #[test]
    fn partial_override() -> Result<(), ShardTxError> {
        let config_str = Some("label = 'hot'\nmax_us = 1000");
        let knobs = parsed_config!(config_str => RetryKnobs; max_us, label)?;
        assert_eq!(
            knobs,
            RetryKnobs {
                max_us: 1000,
                label: "hot".into(),
                ..Default::default()
            }
        );
        Ok(())
    }

    #[test]
    fn unknown_key_rejected() {
        // known to the struct but not in the accepted list
        let config_str = Some("max_us = 10\nfactor = 2");
        let res = parsed_config!(config_str => RetryKnobs; max_us);
        assert_eq!(res.unwrap_err().errcode(), ErrCode::Inval);
    }

    #[test]
    fn wrong_type_rejected() {
        let config_str = Some("factor = 'many'");
        assert!(parsed_config!(config_str => RetryKnobs; factor).is_err());
    }
}
