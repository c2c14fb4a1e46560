//! End-to-end test suite for the acquisition runtime.

#[cfg(test)]
mod log_roundtrip;

#[cfg(test)]
mod reward_e2e;

#[cfg(test)]
mod series_pipeline;
