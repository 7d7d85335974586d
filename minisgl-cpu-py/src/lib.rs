use minisgl_cpu_core::{SamplingParams, SchedulerConfig};
use pyo3::prelude::*;

#[pyclass(name = "SamplingParams")]
#[derive(Clone, Debug)]
struct PySamplingParams {
    #[pyo3(get, set)]
    temperature: f32,
    #[pyo3(get, set)]
    top_k: i32,
    #[pyo3(get, set)]
    top_p: f32,
    #[pyo3(get, set)]
    ignore_eos: bool,
    #[pyo3(get, set)]
    max_new_tokens: Option<u32>,
    #[pyo3(get, set)]
    json_schema: Option<String>,
    #[pyo3(get, set)]
    regex: Option<String>,
    #[pyo3(get, set)]
    skip_special_tokens: bool,
    #[pyo3(get, set)]
    spaces_between_special_tokens: bool,
    #[pyo3(get, set)]
    no_stop_trim: bool,
    #[pyo3(get, set)]
    stop: Option<Vec<String>>,
}

#[pymethods]
impl PySamplingParams {
    #[new]
    fn new() -> Self {
        let p = SamplingParams::default();
        Self {
            temperature: p.temperature,
            top_k: p.top_k,
            top_p: p.top_p,
            ignore_eos: p.ignore_eos,
            max_new_tokens: p.max_new_tokens,
            json_schema: p.json_schema,
            regex: p.regex,
            skip_special_tokens: p.skip_special_tokens,
            spaces_between_special_tokens: p.spaces_between_special_tokens,
            no_stop_trim: p.no_stop_trim,
            stop: p.stop,
        }
    }
}

impl From<&PySamplingParams> for SamplingParams {
    fn from(p: &PySamplingParams) -> Self {
        Self {
            temperature: p.temperature,
            top_k: p.top_k,
            top_p: p.top_p,
            ignore_eos: p.ignore_eos,
            max_new_tokens: p.max_new_tokens,
            json_schema: p.json_schema.clone(),
            regex: p.regex.clone(),
            skip_special_tokens: p.skip_special_tokens,
            spaces_between_special_tokens: p.spaces_between_special_tokens,
            no_stop_trim: p.no_stop_trim,
            stop: p.stop.clone(),
        }
    }
}

/// Mirrors the knobs on `SchedulerConfig` that a host process needs to tune
/// without reaching for environment variables.
#[pyclass(name = "SchedulerConfig")]
#[derive(Clone, Debug)]
struct PySchedulerConfig {
    #[pyo3(get, set)]
    max_running_requests: usize,
    #[pyo3(get, set)]
    max_prefill_tokens: usize,
    #[pyo3(get, set)]
    max_req_input_len: usize,
    #[pyo3(get, set)]
    max_total_num_tokens: usize,
    #[pyo3(get, set)]
    req_slot_capacity: usize,
    #[pyo3(get, set)]
    chunked_prefill_size: Option<usize>,
    #[pyo3(get, set)]
    enable_mixed_chunk: bool,
    #[pyo3(get, set)]
    max_loras_per_batch: usize,
    #[pyo3(get, set)]
    schedule_conservativeness: f32,
    #[pyo3(get, set)]
    disable_regex_jump_forward: bool,
}

#[pymethods]
impl PySchedulerConfig {
    #[new]
    fn new() -> Self {
        let c = SchedulerConfig::from_env();
        Self {
            max_running_requests: c.max_running_requests,
            max_prefill_tokens: c.max_prefill_tokens,
            max_req_input_len: c.max_req_input_len,
            max_total_num_tokens: c.max_total_num_tokens,
            req_slot_capacity: c.req_slot_capacity,
            chunked_prefill_size: c.chunked_prefill_size,
            enable_mixed_chunk: c.enable_mixed_chunk,
            max_loras_per_batch: c.max_loras_per_batch,
            schedule_conservativeness: c.schedule_conservativeness,
            disable_regex_jump_forward: c.disable_regex_jump_forward,
        }
    }
}

#[pyfunction]
fn ping() -> &'static str {
    "ok"
}

#[pyfunction]
fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[pymodule]
fn mini_sgl_cpu_rs(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_function(wrap_pyfunction!(ping, m)?)?;
    m.add_function(wrap_pyfunction!(core_version, m)?)?;
    m.add_class::<PySamplingParams>()?;
    m.add_class::<PySchedulerConfig>()?;
    Ok(())
}
