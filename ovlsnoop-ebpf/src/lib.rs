#![no_std]

pub mod dentry;
pub mod syscalls;
pub mod task;
#[allow(non_upper_case_globals)]
#[allow(non_snake_case)]
#[allow(non_camel_case_types)]
#[allow(dead_code)]
pub mod vmlinux;
