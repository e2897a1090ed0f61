//! OpenAPI documentation definition.

use edgetune_core::probe::{CpuFreq, ReportSnapshot, SwapDevice, Thermal, ThrottleFlags};
use utoipa::OpenApi;

use crate::handlers::ErrorBody;

#[derive(OpenApi)]
#[openapi(
    paths(
        crate::handlers::handle_health,
        crate::handlers::handle_perf,
        crate::handlers::handle_perf_raw,
    ),
    components(schemas(ReportSnapshot, CpuFreq, SwapDevice, Thermal, ThrottleFlags, ErrorBody)),
    info(
        title = "edgetune diagnostics API",
        version = "1.0",
        description = "On-demand memory, swap and thermal report for a tuned edge device"
    )
)]
pub(crate) struct ApiDoc;
