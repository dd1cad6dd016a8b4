//! Custom Resource Definitions for the operator.

mod ndb_cluster;

pub use ndb_cluster::{
    ImageSpec, MysqldSpec, NdbCluster, NdbClusterCondition, NdbClusterSpec, NdbClusterStatus,
    NdbNodeType, API_START_NODE_ID, CONDITION_UP_TO_DATE, MAX_NUMBER_OF_NODES, MYSQLD_PORT,
    NDB_PORT, REASON_ERROR, REASON_ISR, REASON_SPEC_UPDATE_IN_PROGRESS, REASON_SYNC_SUCCESS,
};
