use std::fmt;

/// MeasureKind identifies how a metric is reduced at flush time.
/// Derived from the statsd type suffix on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MeasureKind {
    /// `c`: summed per dimension key.
    Count = 0,
    /// `g`: last observation per dimension key wins.
    Last = 1,
    /// `ms` / `s`: kept per record, filtered by domain.
    Timer = 2,
}

/// Number of MeasureKind variants, used for array sizing.
pub const MEASURE_KIND_CARDINALITY: usize = 3;

impl MeasureKind {
    /// Maps a statsd type suffix to a kind.
    pub fn from_suffix(suffix: &str) -> Option<Self> {
        match suffix {
            "c" => Some(Self::Count),
            "g" => Some(Self::Last),
            "ms" | "s" => Some(Self::Timer),
            _ => None,
        }
    }

    /// Returns the canonical metric/log label name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Count => "count",
            Self::Last => "last",
            Self::Timer => "timer",
        }
    }

    /// Convert from a raw u8 value.
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Count),
            1 => Some(Self::Last),
            2 => Some(Self::Timer),
            _ => None,
        }
    }

    /// All kinds in declaration order.
    pub fn all() -> &'static [MeasureKind] {
        &[Self::Count, Self::Last, Self::Timer]
    }
}

impl fmt::Display for MeasureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single observation decoded from one datagram.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricPoint {
    pub app: String,
    pub domain: String,
    pub value: f64,
    /// Ingestion wall clock, seconds since the Unix epoch.
    pub timestamp: f64,
    pub check: Option<String>,
    pub name: Option<String>,
}

/// A metric point together with its measure kind; the unit held by the buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct TypedRecord {
    pub point: MetricPoint,
    pub kind: MeasureKind,
}

impl TypedRecord {
    pub fn new(point: MetricPoint, kind: MeasureKind) -> Self {
        Self { point, kind }
    }
}
