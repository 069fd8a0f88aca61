//! Process-scope metrics that exist independent of any discovered app or
//! service (spec §6).

use prometheus::{Gauge, Opts, Registry};

use crate::error::{Error, Result};

/// Registers `paas_exporter_build_info{version}`, a constant 1-valued
/// gauge used to expose the running build's version as a label, in the
/// style Prometheus exporters conventionally report their own build
/// metadata.
pub fn register_build_info(registry: &Registry, version: &str) -> Result<()> {
    let gauge = Gauge::with_opts(
        Opts::new("paas_exporter_build_info", "Build information for the running exporter")
            .const_label("version", version),
    )
    .map_err(Error::DuplicateRegistration)?;
    gauge.set(1.0);
    registry.register(Box::new(gauge)).map_err(Error::DuplicateRegistration)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_build_info_with_version_label() {
        let registry = Registry::new();
        register_build_info(&registry, "1.2.3").unwrap();

        let families = registry.gather();
        assert_eq!(families.len(), 1);
        let metric = &families[0].get_metric()[0];
        assert_eq!(metric.get_gauge().get_value(), 1.0);
        assert!(metric.get_label().iter().any(|l| l.get_name() == "version" && l.get_value() == "1.2.3"));
    }
}
