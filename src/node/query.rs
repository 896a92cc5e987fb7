//! Per-node interrogation stages.
//!
//! Each node is driven through an ordered pipeline of query stages. A stage
//! issues its request(s) and stays current until the matching reply makes a
//! handler report completion, at which point the node advances. The
//! progression is event-driven: completions arrive as items on the Query
//! queue, never as chained futures.

/// One step of the interrogation pipeline, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum QueryStage {
    /// Protocol capabilities from the controller (listening, device class).
    ProtocolInfo,
    /// Node info frame from the device itself (supported command classes).
    NodeInfo,
    /// Multi-instance topology.
    Instances,
    /// Wake-up interval of battery nodes.
    WakeUp,
    /// Manufacturer and product identification.
    ManufacturerSpecific,
    /// Command-class versions.
    Versions,
    /// Security capability report.
    SecurityReport,
    /// Association groups.
    Associations,
    /// Session values (infrequently changing state).
    Session,
    /// Dynamic values (frequently changing state).
    Dynamic,
    /// Interrogation finished.
    Complete,
    /// Not yet started.
    None,
}

impl QueryStage {
    /// The stage following this one.
    pub fn next(self) -> QueryStage {
        match self {
            QueryStage::ProtocolInfo => QueryStage::NodeInfo,
            QueryStage::NodeInfo => QueryStage::Instances,
            QueryStage::Instances => QueryStage::WakeUp,
            QueryStage::WakeUp => QueryStage::ManufacturerSpecific,
            QueryStage::ManufacturerSpecific => QueryStage::Versions,
            QueryStage::Versions => QueryStage::SecurityReport,
            QueryStage::SecurityReport => QueryStage::Associations,
            QueryStage::Associations => QueryStage::Session,
            QueryStage::Session => QueryStage::Dynamic,
            QueryStage::Dynamic => QueryStage::Complete,
            QueryStage::Complete | QueryStage::None => QueryStage::Complete,
        }
    }

    /// Stage name, used in logs and the persisted config.
    pub fn name(self) -> &'static str {
        match self {
            QueryStage::ProtocolInfo => "ProtocolInfo",
            QueryStage::NodeInfo => "NodeInfo",
            QueryStage::Instances => "Instances",
            QueryStage::WakeUp => "WakeUp",
            QueryStage::ManufacturerSpecific => "ManufacturerSpecific",
            QueryStage::Versions => "Versions",
            QueryStage::SecurityReport => "SecurityReport",
            QueryStage::Associations => "Associations",
            QueryStage::Session => "Session",
            QueryStage::Dynamic => "Dynamic",
            QueryStage::Complete => "Complete",
            QueryStage::None => "None",
        }
    }

    /// Parse a persisted stage name.
    pub fn from_name(name: &str) -> Option<QueryStage> {
        Some(match name {
            "ProtocolInfo" => QueryStage::ProtocolInfo,
            "NodeInfo" => QueryStage::NodeInfo,
            "Instances" => QueryStage::Instances,
            "WakeUp" => QueryStage::WakeUp,
            "ManufacturerSpecific" => QueryStage::ManufacturerSpecific,
            "Versions" => QueryStage::Versions,
            "SecurityReport" => QueryStage::SecurityReport,
            "Associations" => QueryStage::Associations,
            "Session" => QueryStage::Session,
            "Dynamic" => QueryStage::Dynamic,
            "Complete" => QueryStage::Complete,
            "None" => QueryStage::None,
            _ => return None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipeline_order() {
        let mut stage = QueryStage::ProtocolInfo;
        let mut seen = vec![stage];
        while stage != QueryStage::Complete {
            stage = stage.next();
            seen.push(stage);
        }
        assert_eq!(
            seen,
            vec![
                QueryStage::ProtocolInfo,
                QueryStage::NodeInfo,
                QueryStage::Instances,
                QueryStage::WakeUp,
                QueryStage::ManufacturerSpecific,
                QueryStage::Versions,
                QueryStage::SecurityReport,
                QueryStage::Associations,
                QueryStage::Session,
                QueryStage::Dynamic,
                QueryStage::Complete,
            ]
        );
    }

    #[test]
    fn test_complete_is_terminal() {
        assert_eq!(QueryStage::Complete.next(), QueryStage::Complete);
    }

    #[test]
    fn test_name_roundtrip() {
        let mut stage = QueryStage::ProtocolInfo;
        loop {
            assert_eq!(QueryStage::from_name(stage.name()), Some(stage));
            if stage == QueryStage::Complete {
                break;
            }
            stage = stage.next();
        }
        assert_eq!(QueryStage::from_name("Bogus"), None);
    }
}
