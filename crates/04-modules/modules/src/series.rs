//! Typed columnar outputs produced by log extraction.
//!
//! Each variant fixes the column names and dtypes for one module family;
//! the extraction pipeline turns these into on-disk columnar files without
//! further interpretation.

/// A module's extracted time series. Timestamps are onset-relative
/// microseconds throughout.
#[derive(Debug, Clone, PartialEq)]
pub enum ModuleSeries {
    /// Valve: cumulative dispensed volume.
    CumulativeVolume {
        timestamp_us: Vec<u64>,
        volume_ul: Vec<f64>,
    },
    /// Lick sensor: raw ADC plus the re-derived binary lick state.
    LickStates {
        timestamp_us: Vec<u64>,
        adc_value: Vec<u16>,
        lick_state: Vec<u8>,
    },
    /// TTL input: rising-edge timestamps only.
    RisingEdges { timestamp_us: Vec<u64> },
    /// Brake / torque sensor: torque in Newton-centimeters.
    Torque {
        timestamp_us: Vec<u64>,
        torque_ncm: Vec<f64>,
    },
    /// Encoder: cumulative absolute position in centimeters.
    Position {
        timestamp_us: Vec<u64>,
        position_cm: Vec<f64>,
    },
    /// Screen (or any two-state device): reconstructed binary state.
    BinaryState {
        timestamp_us: Vec<u64>,
        state: Vec<u8>,
    },
    /// Analog input: raw ADC pass-through.
    Analog {
        timestamp_us: Vec<u64>,
        adc_value: Vec<u16>,
    },
}

impl ModuleSeries {
    /// Column headers, timestamp first.
    pub fn column_names(&self) -> &'static [&'static str] {
        match self {
            ModuleSeries::CumulativeVolume { .. } => &["timestamp_us", "volume_ul"],
            ModuleSeries::LickStates { .. } => &["timestamp_us", "adc_value", "lick_state"],
            ModuleSeries::RisingEdges { .. } => &["timestamp_us"],
            ModuleSeries::Torque { .. } => &["timestamp_us", "torque_ncm"],
            ModuleSeries::Position { .. } => &["timestamp_us", "position_cm"],
            ModuleSeries::BinaryState { .. } => &["timestamp_us", "state"],
            ModuleSeries::Analog { .. } => &["timestamp_us", "adc_value"],
        }
    }

    /// Number of rows in the series.
    pub fn len(&self) -> usize {
        match self {
            ModuleSeries::CumulativeVolume { timestamp_us, .. }
            | ModuleSeries::LickStates { timestamp_us, .. }
            | ModuleSeries::RisingEdges { timestamp_us }
            | ModuleSeries::Torque { timestamp_us, .. }
            | ModuleSeries::Position { timestamp_us, .. }
            | ModuleSeries::BinaryState { timestamp_us, .. }
            | ModuleSeries::Analog { timestamp_us, .. } => timestamp_us.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Renders row `index` as display strings, column order matching
    /// [`column_names`](Self::column_names).
    pub fn row(&self, index: usize) -> Vec<String> {
        match self {
            ModuleSeries::CumulativeVolume {
                timestamp_us,
                volume_ul,
            } => vec![timestamp_us[index].to_string(), volume_ul[index].to_string()],
            ModuleSeries::LickStates {
                timestamp_us,
                adc_value,
                lick_state,
            } => vec![
                timestamp_us[index].to_string(),
                adc_value[index].to_string(),
                lick_state[index].to_string(),
            ],
            ModuleSeries::RisingEdges { timestamp_us } => {
                vec![timestamp_us[index].to_string()]
            }
            ModuleSeries::Torque {
                timestamp_us,
                torque_ncm,
            } => vec![
                timestamp_us[index].to_string(),
                torque_ncm[index].to_string(),
            ],
            ModuleSeries::Position {
                timestamp_us,
                position_cm,
            } => vec![
                timestamp_us[index].to_string(),
                position_cm[index].to_string(),
            ],
            ModuleSeries::BinaryState {
                timestamp_us,
                state,
            } => vec![timestamp_us[index].to_string(), state[index].to_string()],
            ModuleSeries::Analog {
                timestamp_us,
                adc_value,
            } => vec![
                timestamp_us[index].to_string(),
                adc_value[index].to_string(),
            ],
        }
    }
}
