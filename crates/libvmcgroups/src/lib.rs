//! Control group management for virtual machine compute processes, behind one
//! manager abstraction that works the same on cgroup v1 and v2 hosts.
#[cfg(test)]
#[macro_use]
extern crate quickcheck;


pub mod common;
pub mod controller_type;
pub mod cpuset;
pub mod dedicated;
pub mod devices;
pub mod isolation;
pub mod process;
pub mod resolver;
pub mod test_manager;
pub mod trampoline;
pub mod v1;
pub mod v2;
