use crate::statsd::MetricPoint;

/// Grouping key for count and last aggregation.
/// Absent `check`/`name` group together as their own key value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DimensionKey {
    pub app: String,
    pub domain: String,
    pub check: Option<String>,
    pub name: Option<String>,
}

impl DimensionKey {
    pub fn of(point: &MetricPoint) -> Self {
        Self {
            app: point.app.clone(),
            domain: point.domain.clone(),
            check: point.check.clone(),
            name: point.name.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(check: Option<&str>, name: Option<&str>) -> MetricPoint {
        MetricPoint {
            app: "airflow".to_string(),
            domain: "pool".to_string(),
            value: 1.0,
            timestamp: 0.0,
            check: check.map(str::to_string),
            name: name.map(str::to_string),
        }
    }

    #[test]
    fn test_absent_fields_are_distinct_from_empty() {
        let absent = DimensionKey::of(&point(None, None));
        let empty = DimensionKey::of(&point(Some(""), None));
        assert_ne!(absent, empty);
        assert_eq!(absent, DimensionKey::of(&point(None, None)));
    }

    #[test]
    fn test_value_and_timestamp_not_part_of_key() {
        let mut a = point(Some("open_slots"), Some("default_pool"));
        let b = a.clone();
        a.value = 42.0;
        a.timestamp = 99.0;
        assert_eq!(DimensionKey::of(&a), DimensionKey::of(&b));
    }
}
