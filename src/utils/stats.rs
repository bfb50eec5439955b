use crate::utils::error::Result;
use polars::prelude::*;

/// 描述性統計，對應常見的 describe() 輸出
#[derive(Debug, Clone, PartialEq)]
pub struct Describe {
    pub count: usize,
    pub mean: f64,
    pub std: f64,
    pub min: f64,
    pub p1: f64,
    pub p25: f64,
    pub p50: f64,
    pub p75: f64,
    pub p99: f64,
    pub max: f64,
}

impl Describe {
    /// NaN 與無窮值會被忽略；沒有有效值時回傳 None
    pub fn from_values(values: impl IntoIterator<Item = f64>) -> Result<Option<Self>> {
        let finite: Vec<f64> = values.into_iter().filter(|v| v.is_finite()).collect();
        Self::from_chunked(&Float64Chunked::from_vec("values".into(), finite))
    }

    /// 直接描述 DataFrame 的一欄，缺值會被忽略
    pub fn from_column(column: &Column) -> Result<Option<Self>> {
        let series = column.as_materialized_series().cast(&DataType::Float64)?;
        Self::from_values(series.f64()?.into_iter().flatten())
    }

    fn from_chunked(values: &Float64Chunked) -> Result<Option<Self>> {
        if values.is_empty() {
            return Ok(None);
        }
        let quantile = |q: f64| -> Result<f64> {
            Ok(values
                .quantile(q, QuantileMethod::Linear)?
                .unwrap_or(f64::NAN))
        };
        let count = values.len();

        Ok(Some(Self {
            count,
            mean: values.mean().unwrap_or(f64::NAN),
            std: if count > 1 { values.std(1).unwrap_or(0.0) } else { 0.0 },
            min: values.min().unwrap_or(f64::NAN),
            p1: quantile(0.01)?,
            p25: quantile(0.25)?,
            p50: quantile(0.5)?,
            p75: quantile(0.75)?,
            p99: quantile(0.99)?,
            max: values.max().unwrap_or(f64::NAN),
        }))
    }

    pub fn render(&self) -> String {
        format!(
            "count {:>14}\nmean  {:>14.4}\nstd   {:>14.4}\nmin   {:>14.4}\n1%    {:>14.4}\n25%   {:>14.4}\n50%   {:>14.4}\n75%   {:>14.4}\n99%   {:>14.4}\nmax   {:>14.4}",
            self.count, self.mean, self.std, self.min, self.p1, self.p25, self.p50, self.p75, self.p99, self.max
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_describe_ignores_nan() {
        let d = Describe::from_values(vec![1.0, 2.0, 3.0, 4.0, f64::NAN])
            .unwrap()
            .unwrap();
        assert_eq!(d.count, 4);
        assert_eq!(d.mean, 2.5);
        assert_eq!(d.min, 1.0);
        assert_eq!(d.max, 4.0);
        assert_eq!(d.p50, 2.5);
        assert_eq!(d.p25, 1.75);
    }

    #[test]
    fn test_describe_empty() {
        assert!(Describe::from_values(Vec::<f64>::new()).unwrap().is_none());
        assert!(Describe::from_values(vec![f64::NAN, f64::INFINITY]).unwrap().is_none());
    }

    #[test]
    fn test_describe_column_skips_nulls() {
        let column = Column::new("$close".into(), vec![Some(2.0f32), None, Some(4.0)]);
        let d = Describe::from_column(&column).unwrap().unwrap();
        assert_eq!(d.count, 2);
        assert_eq!(d.mean, 3.0);
        assert!((d.std - std::f64::consts::SQRT_2).abs() < 1e-9);
        assert!((d.p99 - 3.98).abs() < 1e-9);
    }
}
