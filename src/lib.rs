// netwarden - per-container packet-filter policy for overlay container hosts.
// The CNI plugin installs each container's chains; the agent keeps the
// host's C2C and ASG chains converged with the policy service.

pub mod agent;
pub mod cni;
pub mod datastore;
pub mod iptables;
pub mod utils;
