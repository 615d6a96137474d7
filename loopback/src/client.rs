use bibw_shared::{
    sweep::LatencyLog, transport::loopback::LoopbackTransport, Result, RoleOrchestrator,
};

use crate::spec::Spec;

pub fn connect(spec: Spec, transport: LoopbackTransport) -> Result<()> {
    RoleOrchestrator::new(spec.connector(), transport).run(&mut LatencyLog)
}
