use std::{
    any::{TypeId, type_name},
    sync::Arc,
    time::Duration,
};

use dashmap::DashMap;
use opentelemetry::{
    KeyValue,
    metrics::{Counter, Histogram},
};
use quote::ToTokens;
use syn::{Type, parse_str};

use crate::bus::report::{DispatchOutcome, DispatchReport};

#[derive(Debug, Clone)]
pub struct BusMetrics {
    labels: Arc<DashMap<TypeId, KeyValue>>,
    dispatch: Counter<u64>,
    handler_failures: Counter<u64>,
    latency: Histogram<u64>,
    cache: Counter<u64>,
    dedup_joins: Counter<u64>,
}

impl BusMetrics {
    /// Instruments on the global meter provider. Without an installed provider
    /// they are no-ops.
    pub fn global() -> BusMetrics {
        let meter = opentelemetry::global::meter("plexus_bus");

        BusMetrics {
            labels: Arc::new(DashMap::new()),
            dispatch: meter.u64_counter("bus_dispatch").build(),
            handler_failures: meter.u64_counter("bus_handler_failures").build(),
            latency: meter.u64_histogram("bus_dispatch_latency_us").build(),
            cache: meter.u64_counter("bus_query_cache").build(),
            dedup_joins: meter.u64_counter("bus_query_dedup_joins").build(),
        }
    }

    // Simplify a type name down to its last path segments, keeping generics
    fn simplify_type_name(type_name: &str) -> String {
        let Ok(parsed_type) = parse_str::<Type>(type_name) else {
            return type_name.to_string();
        };

        fn simplify_type(ty: &Type) -> String {
            match ty {
                Type::Path(type_path) => {
                    let Some(last_segment) = type_path.path.segments.last() else {
                        return ty.to_token_stream().to_string();
                    };
                    let ident = &last_segment.ident;

                    if let syn::PathArguments::AngleBracketed(args) = &last_segment.arguments {
                        let args_str = args
                            .args
                            .iter()
                            .map(|arg| match arg {
                                syn::GenericArgument::Type(inner_ty) => simplify_type(inner_ty),
                                _ => arg.to_token_stream().to_string(),
                            })
                            .collect::<Vec<_>>()
                            .join(", ");
                        format!("{ident}<{args_str}>")
                    } else {
                        ident.to_string()
                    }
                }
                _ => ty.to_token_stream().to_string(),
            }
        }

        simplify_type(&parsed_type)
    }

    fn label<Msg: 'static>(&self) -> KeyValue {
        self.labels
            .entry(TypeId::of::<Msg>())
            .or_insert_with(|| {
                KeyValue::new("msg", BusMetrics::simplify_type_name(type_name::<Msg>()))
            })
            .clone()
    }

    pub fn dispatched<Msg: 'static>(&self, kind: &'static str, report: &DispatchReport) {
        let outcome = match report.outcome {
            DispatchOutcome::Completed => "completed",
            DispatchOutcome::NoHandler => "no_handler",
            DispatchOutcome::Faulted => "faulted",
            DispatchOutcome::Cancelled => "cancelled",
        };
        let labels = [
            self.label::<Msg>(),
            KeyValue::new("kind", kind),
            KeyValue::new("outcome", outcome),
        ];
        self.dispatch.add(1, &labels);
        if report.failed > 0 {
            self.handler_failures.add(report.failed as u64, &labels[..2]);
        }
        self.latency
            .record(report.elapsed.as_micros() as u64, &labels[..2]);
    }

    pub fn queried<Msg: 'static>(&self, outcome: &'static str, elapsed: Duration) {
        let labels = [
            self.label::<Msg>(),
            KeyValue::new("kind", "query"),
            KeyValue::new("outcome", outcome),
        ];
        self.dispatch.add(1, &labels);
        if outcome == "faulted" {
            self.handler_failures.add(1, &labels[..2]);
        }
        self.latency.record(elapsed.as_micros() as u64, &labels[..2]);
    }

    pub fn cache_lookup<Msg: 'static>(&self, hit: bool) {
        self.cache.add(
            1,
            &[
                self.label::<Msg>(),
                KeyValue::new("result", if hit { "hit" } else { "miss" }),
            ],
        );
    }

    pub fn dedup_join<Msg: 'static>(&self) {
        self.dedup_joins.add(1, &[self.label::<Msg>()]);
    }

    pub fn simplified_name<T>() -> String {
        BusMetrics::simplify_type_name(type_name::<T>())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simplified_names() {
        assert_eq!(
            BusMetrics::simplified_name::<std::collections::HashMap<String, Vec<u8>>>(),
            "HashMap<String, Vec<u8>>"
        );
        assert_eq!(BusMetrics::simplified_name::<u64>(), "u64");
    }
}
