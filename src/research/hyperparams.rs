use crate::utils::error::{EtlError, Result};
use serde_json::Value;

/// 模型訓練超參數，以環境變數交給訓練腳本
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingHyperparameters {
    pub n_epochs: u32,
    pub lr: f64,
    pub early_stop: u32,
    pub batch_size: u32,
    pub weight_decay: f64,
}

impl Default for TrainingHyperparameters {
    fn default() -> Self {
        Self {
            n_epochs: 100,
            lr: 1e-3,
            early_stop: 10,
            batch_size: 256,
            weight_decay: 1e-4,
        }
    }
}

fn number(map: &serde_json::Map<String, Value>, key: &str) -> Result<Option<f64>> {
    let parsed = match map.get(key) {
        None | Some(Value::Null) => None,
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => Some(s.trim().parse::<f64>().map_err(|_| {
            EtlError::InvalidConfigValueError {
                field: key.to_string(),
                value: s.clone(),
                reason: "not a number".to_string(),
            }
        })?),
        Some(other) => {
            return Err(EtlError::InvalidConfigValueError {
                field: key.to_string(),
                value: other.to_string(),
                reason: "not a number".to_string(),
            })
        }
    };
    Ok(parsed)
}

fn count(map: &serde_json::Map<String, Value>, key: &str, default: u32) -> Result<u32> {
    match number(map, key)? {
        None => Ok(default),
        Some(v) if v >= 0.0 && v.fract() == 0.0 && v <= u32::MAX as f64 => Ok(v as u32),
        Some(v) => Err(EtlError::InvalidConfigValueError {
            field: key.to_string(),
            value: v.to_string(),
            reason: "must be a non-negative integer".to_string(),
        }),
    }
}

impl TrainingHyperparameters {
    /// 接受 JSON 物件或內容為 JSON 物件的字串；空值或空物件回傳 `None`
    pub fn from_value(value: &Value) -> Result<Option<Self>> {
        let owned;
        let value = match value {
            Value::String(s) if s.trim().is_empty() => return Ok(None),
            Value::String(s) => {
                owned = serde_json::from_str::<Value>(s)?;
                &owned
            }
            other => other,
        };
        let map = match value {
            Value::Null => return Ok(None),
            Value::Object(map) if map.is_empty() => return Ok(None),
            Value::Object(map) => map,
            other => {
                return Err(EtlError::ValidationError {
                    message: format!("training_hyperparameters must be an object, got {}", other),
                })
            }
        };

        let defaults = Self::default();
        Ok(Some(Self {
            n_epochs: count(map, "n_epochs", defaults.n_epochs)?,
            lr: number(map, "lr")?.unwrap_or(defaults.lr),
            early_stop: count(map, "early_stop", defaults.early_stop)?,
            batch_size: count(map, "batch_size", defaults.batch_size)?,
            weight_decay: number(map, "weight_decay")?.unwrap_or(defaults.weight_decay),
        }))
    }

    pub fn to_env(&self) -> Vec<(String, String)> {
        vec![
            ("n_epochs".to_string(), self.n_epochs.to_string()),
            ("lr".to_string(), self.lr.to_string()),
            ("early_stop".to_string(), self.early_stop.to_string()),
            ("batch_size".to_string(), self.batch_size.to_string()),
            ("weight_decay".to_string(), self.weight_decay.to_string()),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults_fill_missing_keys() {
        let params = TrainingHyperparameters::from_value(&json!({"n_epochs": 20}))
            .unwrap()
            .unwrap();
        assert_eq!(params.n_epochs, 20);
        assert_eq!(params.batch_size, 256);
        assert_eq!(params.lr, 1e-3);
    }

    #[test]
    fn test_accepts_json_string() {
        let value = json!("{\"lr\": \"5e-4\", \"batch_size\": 512}");
        let params = TrainingHyperparameters::from_value(&value).unwrap().unwrap();
        assert_eq!(params.lr, 5e-4);
        assert_eq!(params.batch_size, 512);
    }

    #[test]
    fn test_empty_means_none() {
        assert!(TrainingHyperparameters::from_value(&json!({})).unwrap().is_none());
        assert!(TrainingHyperparameters::from_value(&Value::Null).unwrap().is_none());
        assert!(TrainingHyperparameters::from_value(&json!("")).unwrap().is_none());
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(TrainingHyperparameters::from_value(&json!({"n_epochs": 1.5})).is_err());
        assert!(TrainingHyperparameters::from_value(&json!([1, 2])).is_err());
        assert!(TrainingHyperparameters::from_value(&json!("not json")).is_err());
    }

    #[test]
    fn test_env_rendering() {
        let env = TrainingHyperparameters::default().to_env();
        assert!(env.contains(&("weight_decay".to_string(), "0.0001".to_string())));
        assert!(env.contains(&("lr".to_string(), "0.001".to_string())));
        assert!(env.contains(&("n_epochs".to_string(), "100".to_string())));
    }
}
