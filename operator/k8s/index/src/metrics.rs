use prometheus_client::{
    collector::Collector,
    encoding::{DescriptorEncoder, EncodeMetric},
    metrics::{gauge::ConstGauge, MetricType},
    registry::Registry,
};

use super::SharedIndex;

#[derive(Debug)]
struct Instrumented(SharedIndex);

pub fn register(reg: &mut Registry, index: SharedIndex) {
    reg.register_collector(Box::new(Instrumented(index)));
}

impl Collector for Instrumented {
    fn encode(&self, mut encoder: DescriptorEncoder<'_>) -> Result<(), std::fmt::Error> {
        let this = self.0.read();

        let jobs_encoder = encoder.encode_descriptor(
            "size",
            "The number of finalization jobs in the owned-job index",
            None,
            MetricType::Gauge,
        )?;
        ConstGauge::new(this.len() as u32).encode(jobs_encoder)?;

        let mut by_ns_encoder = encoder.encode_descriptor(
            "namespace_size",
            "The number of finalization jobs in the owned-job index per namespace",
            None,
            MetricType::Gauge,
        )?;
        for (ns, index) in &this.namespaces {
            let labels = vec![("namespace", ns.as_str())];
            let jobs = ConstGauge::new(index.owners.len() as u32);
            jobs.encode(by_ns_encoder.encode_family(&labels)?)?;
        }

        Ok(())
    }
}
