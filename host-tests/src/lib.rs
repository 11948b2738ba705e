//! Host-based scenario tests for the C6 CO2 node.
//! A whole node (sensing loop plus network worker) runs against the
//! in-memory backends from `c6_co2_node::sim`, driven tick by tick.

#[cfg(test)]
mod rig;

#[cfg(test)]
mod ota_flow;

#[cfg(test)]
mod control_flow;

#[cfg(test)]
mod concurrency;
