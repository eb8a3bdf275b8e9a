//! Structured records for the node-level `/stats` and `/` resources.
//!
//! Only the fields declared here are decoded; anything else the node
//! reports is ignored.

use serde::{Deserialize, Serialize};

/// Subset of a node's `/stats` report.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeStatus {
    pub nodename: Option<String>,
    pub vnode_gets: u64,
    pub vnode_puts: u64,
    pub vnode_gets_total: u64,
    pub vnode_puts_total: u64,
    pub node_gets: u64,
    pub node_gets_total: u64,
    pub node_puts: u64,
    pub node_puts_total: u64,
    pub node_get_fsm_time_mean: Option<f64>,
    pub node_get_fsm_time_median: Option<f64>,
    pub node_get_fsm_time_95: Option<f64>,
    pub node_get_fsm_time_99: Option<f64>,
    pub node_get_fsm_time_100: Option<f64>,
    pub node_put_fsm_time_mean: Option<f64>,
    pub node_put_fsm_time_median: Option<f64>,
    pub node_put_fsm_time_95: Option<f64>,
    pub node_put_fsm_time_99: Option<f64>,
    pub node_put_fsm_time_100: Option<f64>,
    pub read_repairs: u64,
    pub read_repairs_total: u64,
    pub cpu_nprocs: u64,
    pub cpu_avg1: u64,
    pub cpu_avg5: u64,
    pub cpu_avg15: u64,
    pub mem_total: u64,
    pub mem_allocated: u64,
    pub connected_nodes: Vec<String>,
    pub ring_members: Vec<String>,
    pub ring_num_partitions: u64,
    pub ring_creation_size: u64,
    pub storage_backend: Option<String>,
    pub pbc_connects_total: u64,
    pub pbc_connects: u64,
    pub pbc_active: u64,
    pub riak_kv_version: Option<String>,
    pub riak_core_version: Option<String>,
    pub sys_otp_release: Option<String>,
    pub sys_process_count: u64,
    pub sys_logical_processors: u64,
    pub sys_wordsize: u64,
}

/// Resource paths advertised by a node at `/`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Resources {
    pub riak_kv_wm_buckets: Option<String>,
    pub riak_kv_wm_index: Option<String>,
    pub riak_kv_wm_link_walker: Option<String>,
    pub riak_kv_wm_mapred: Option<String>,
    pub riak_kv_wm_object: Option<String>,
    pub riak_kv_wm_ping: Option<String>,
    pub riak_kv_wm_props: Option<String>,
    pub riak_kv_wm_stats: Option<String>,
    pub riak_kv_wm_counter: Option<String>,
    pub riak_solr_searcher_wm: Option<String>,
    pub riak_solr_indexer_wm: Option<String>,
}

/// `{"buckets": [...]}` listing body.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct BucketList {
    #[serde(default)]
    pub buckets: Vec<String>,
}

/// `{"keys": [...]}` listing body.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct KeyList {
    #[serde(default)]
    pub keys: Vec<String>,
}
