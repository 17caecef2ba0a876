use crate::containers::SIDECAR_CONTAINER;
use k8s_openapi::{
    api::core::v1::{Container, Probe},
    apimachinery::pkg::util::intstr::IntOrString,
};

/// First ports of the ranges the proxy exposes probe paths on. The
/// container's index in the pod is added to each.
pub const LIVENESS_PORTS_START: i32 = 20300;
pub const READINESS_PORTS_START: i32 = 20400;
pub const STARTUP_PORTS_START: i32 = 20500;

/// Points HTTP probes at the ports the proxy exposes them on, so that kubelet
/// probes pass through the redirected inbound listener.
pub(crate) fn overwrite(containers: &mut [Container]) {
    for (i, c) in containers.iter_mut().enumerate() {
        if c.name == SIDECAR_CONTAINER {
            continue;
        }
        let i = i as i32;
        redirect(c.liveness_probe.as_mut(), LIVENESS_PORTS_START + i);
        redirect(c.readiness_probe.as_mut(), READINESS_PORTS_START + i);
        redirect(c.startup_probe.as_mut(), STARTUP_PORTS_START + i);
    }
}

fn redirect(probe: Option<&mut Probe>, port: i32) {
    if let Some(http) = probe.and_then(|p| p.http_get.as_mut()) {
        http.port = IntOrString::Int(port);
    }
}
