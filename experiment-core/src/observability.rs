//! Logging and metrics setup for processes embedding the engine.
//!
//! * `setup_observability` registers the global `tracing` subscriber. The filter comes from
//!   `RUST_LOG` when set, and falls back to `DEFAULT_DIRECTIVES` otherwise.
//! * `describe_metrics` registers descriptions for the metrics emitted through the
//!   `metrics` facade. Installing a recorder/exporter is left to the embedding process.

use metrics::{Unit, describe_counter, describe_histogram};
use serde::Deserialize;
use strum::{Display, EnumString};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::error::{Error, ErrorDetails};

const DEFAULT_DIRECTIVES: &str = "warn,experiment_core=info,experiments=info";

pub const METRIC_EVALUATOR_RUN_TOTAL: &str = "expt_evaluator_run_total";
pub const METRIC_EVALUATOR_RUN_LATENCY: &str = "expt_evaluator_run_latency_seconds";
pub const METRIC_TARGET_EXECUTE_TOTAL: &str = "expt_target_execute_total";
pub const METRIC_SCHEDULER_TICK_TOTAL: &str = "expt_scheduler_tick_total";
pub const METRIC_ITEM_EVAL_TOTAL: &str = "expt_item_eval_total";
pub const METRIC_AGGR_CALCULATE_TOTAL: &str = "expt_aggr_calculate_total";
pub const METRIC_EXPT_FINISHED_TOTAL: &str = "expt_finished_total";
pub const METRIC_QUOTA_DENIED_TOTAL: &str = "expt_quota_denied_total";

#[derive(Clone, Copy, Debug, Default, Deserialize, Display, EnumString, Eq, PartialEq)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

pub fn setup_observability(log_format: LogFormat) -> Result<(), Error> {
    let env_var_name = "RUST_LOG";
    let filter = if std::env::var(env_var_name).is_ok() {
        EnvFilter::builder()
            .with_env_var(env_var_name)
            .from_env()
            .map_err(|e| {
                Error::new(ErrorDetails::Config {
                    message: format!("Invalid `{env_var_name}` environment variable: {e}"),
                })
            })?
    } else {
        EnvFilter::builder().parse(DEFAULT_DIRECTIVES).map_err(|e| {
            Error::new(ErrorDetails::CommonInternal {
                message: format!("Failed to parse default log directives: {e}"),
            })
        })?
    };

    let log_layer = match log_format {
        LogFormat::Pretty => tracing_subscriber::fmt::layer().boxed(),
        LogFormat::Json => tracing_subscriber::fmt::layer().json().boxed(),
    };

    tracing_subscriber::registry()
        .with(log_layer.with_filter(filter))
        .try_init()
        .map_err(|e| {
            Error::new(ErrorDetails::Config {
                message: format!("Failed to install tracing subscriber: {e}"),
            })
        })
}

/// Registers the engine's metrics along with their types and docstrings.
pub fn describe_metrics() {
    describe_counter!(
        METRIC_EVALUATOR_RUN_TOTAL,
        Unit::Count,
        "Evaluator runs, labelled by space, model and error flag",
    );
    describe_histogram!(
        METRIC_EVALUATOR_RUN_LATENCY,
        Unit::Seconds,
        "Wall time of evaluator runs",
    );
    describe_counter!(
        METRIC_TARGET_EXECUTE_TOTAL,
        Unit::Count,
        "Evaluation target executions",
    );
    describe_counter!(
        METRIC_SCHEDULER_TICK_TOTAL,
        Unit::Count,
        "Scheduler ticks, labelled by run mode and whether another tick was scheduled",
    );
    describe_counter!(
        METRIC_ITEM_EVAL_TOTAL,
        Unit::Count,
        "Items evaluated, labelled by final state",
    );
    describe_counter!(
        METRIC_AGGR_CALCULATE_TOTAL,
        Unit::Count,
        "Aggregate result calculations, labelled by mode and error flag",
    );
    describe_counter!(
        METRIC_EXPT_FINISHED_TOTAL,
        Unit::Count,
        "Experiments reaching a terminal status",
    );
    describe_counter!(
        METRIC_QUOTA_DENIED_TOTAL,
        Unit::Count,
        "Run admissions rejected by the workspace concurrency limit",
    );
}
