use aya::{
    maps::{Array, MapError},
    Ebpf,
};
use thiserror::Error;
use tracing::debug;

use ovlsnoop_common::{OvlConfig, TargetComm};

#[derive(Error, Debug)]
pub enum MapOperationError {
    #[error(transparent)]
    Map(#[from] MapError),

    #[error("map {0} not found in the eBPF object")]
    MapNotFound(&'static str),
}

/// Primes the process name filter of the file operations tracer. An empty
/// name disables the tracer.
pub fn set_target_comm(ebpf: &mut Ebpf, comm: &str) -> Result<(), MapOperationError> {
    let target = if comm.is_empty() {
        TargetComm::disabled()
    } else {
        TargetComm::new(comm)
    };
    debug!(
        comm = %target.as_str(),
        map = "TARGET_COMM",
        "writing target comm to eBPF map"
    );

    let mut array: Array<_, TargetComm> = ebpf
        .map_mut("TARGET_COMM")
        .ok_or(MapOperationError::MapNotFound("TARGET_COMM"))?
        .try_into()?;
    array.set(0, target, 0)?;

    Ok(())
}

/// Switches the reporting of `ovl_is_inuse` conflicts of the overlay in-use
/// tracer.
pub fn set_ovl_config(ebpf: &mut Ebpf, trace_is_inuse: bool) -> Result<(), MapOperationError> {
    debug!(trace_is_inuse, map = "CONFIG", "writing config to eBPF map");

    let mut array: Array<_, OvlConfig> = ebpf
        .map_mut("CONFIG")
        .ok_or(MapOperationError::MapNotFound("CONFIG"))?
        .try_into()?;
    let config = OvlConfig {
        trace_is_inuse: trace_is_inuse as u32,
    };
    array.set(0, config, 0)?;

    Ok(())
}
