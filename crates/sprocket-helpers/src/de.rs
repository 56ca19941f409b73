use std::time::Duration;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer};

/// Accepts either a bare seconds integer or a humantime string
/// ("250ms", "2m"). Empty strings deserialize to `None`.
pub fn deserialize_optional_duration<'de, D>(
    deserializer: D
) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawDuration {
        Seconds(u64),
        Text(String),
    }

    let raw = Option::<RawDuration>::deserialize(deserializer)?;
    match raw {
        None => Ok(None),
        Some(RawDuration::Seconds(secs)) => Ok(Some(Duration::from_secs(secs))),
        Some(RawDuration::Text(value)) => {
            let value = value.trim();
            if value.is_empty() {
                return Ok(None);
            }

            humantime::parse_duration(value).map(Some).map_err(D::Error::custom)
        }
    }
}
