use std::io;

use bibw_shared::{
    sweep::TableSink, transport::loopback::LoopbackTransport, Result, RoleOrchestrator,
};

use crate::spec::Spec;

pub fn serve(spec: Spec, transport: LoopbackTransport) -> Result<()> {
    let mut table = TableSink::new(io::stdout().lock());
    RoleOrchestrator::new(spec.listener(), transport).run(&mut table)
}
