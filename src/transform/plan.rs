//! Phase ordering and start-up validation of the router set.

use std::collections::{BTreeMap, BTreeSet};

use thiserror::Error;

use super::{
    CustomDomainRouter, CustomerRouter, MappingKind, ReceiptRouter, Router, SecretRouter,
};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid phase plan: {}", .problems.join("; "))]
pub struct PlanError {
    pub problems: Vec<String>,
}

/// Routers grouped into phases. Routers within a phase are independent;
/// a phase may only consume mapping kinds produced by earlier phases.
pub struct PhasePlan {
    phases: Vec<Vec<Box<dyn Router>>>,
}

impl std::fmt::Debug for PhasePlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let phases: Vec<Vec<&str>> = self
            .phases
            .iter()
            .map(|phase| phase.iter().map(|router| router.source()).collect())
            .collect();
        f.debug_struct("PhasePlan").field("phases", &phases).finish()
    }
}

impl PhasePlan {
    pub fn new(phases: Vec<Vec<Box<dyn Router>>>) -> Result<Self, PlanError> {
        let plan = Self { phases };
        let problems = plan.problems();
        if problems.is_empty() {
            Ok(plan)
        } else {
            Err(PlanError { problems })
        }
    }

    /// `[customer] -> [customdomain, secret] -> [metadata]`
    pub fn standard() -> Result<Self, PlanError> {
        Self::new(vec![
            vec![Box::new(CustomerRouter)],
            vec![Box::new(CustomDomainRouter), Box::new(SecretRouter)],
            vec![Box::new(ReceiptRouter)],
        ])
    }

    pub fn phases(&self) -> &[Vec<Box<dyn Router>>] {
        &self.phases
    }

    pub fn routers(&self) -> impl Iterator<Item = &dyn Router> {
        self.phases.iter().flatten().map(|router| router.as_ref())
    }

    /// Source prefixes in execution order.
    pub fn sources(&self) -> Vec<&'static str> {
        self.routers().map(|router| router.source()).collect()
    }

    fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        let mut sources = BTreeSet::new();
        let mut producers: BTreeMap<MappingKind, Vec<(usize, &'static str)>> = BTreeMap::new();

        for (index, phase) in self.phases.iter().enumerate() {
            for router in phase {
                if !sources.insert(router.source()) {
                    problems.push(format!("source `{}` is routed twice", router.source()));
                }
                for kind in router.produces() {
                    producers
                        .entry(*kind)
                        .or_default()
                        .push((index, router.source()));
                }
            }
        }

        for (kind, list) in &producers {
            if list.len() > 1 {
                let names: Vec<&str> = list.iter().map(|(_, source)| *source).collect();
                problems.push(format!("{kind} is produced by {}", names.join(", ")));
            }
        }

        for (index, phase) in self.phases.iter().enumerate() {
            for router in phase {
                for kind in router.consumes() {
                    match producers.get(kind).map(Vec::as_slice) {
                        Some([(producer_phase, _)]) if *producer_phase < index => {}
                        Some([(_, producer)]) => problems.push(format!(
                            "`{}` consumes {kind} from `{producer}`, which does not run in an earlier phase",
                            router.source()
                        )),
                        Some(_) => {}
                        None => problems.push(format!(
                            "`{}` consumes {kind}, which nothing produces",
                            router.source()
                        )),
                    }
                }
                problems.extend(router_problems(router.as_ref()));
            }
        }
        problems
    }
}

fn router_problems(router: &dyn Router) -> Vec<String> {
    let mut problems = Vec::new();
    for plan in router.plans() {
        let mut seen = BTreeSet::new();
        for (field, _) in plan.entries {
            if !seen.insert(*field) {
                problems.push(format!(
                    "`{}` plan for {} lists `{field}` twice",
                    router.source(),
                    plan.target.name
                ));
            }
        }
        for target in plan.targets() {
            if !plan.target.declares(target) {
                problems.push(format!(
                    "`{}` plan writes undeclared {}.{target}",
                    router.source(),
                    plan.target.name
                ));
            }
        }
        for table in plan.value_tables() {
            problems.extend(table.problems());
        }
    }
    for (schema, fields) in router.derived() {
        for field in *fields {
            if !schema.declares(field) {
                problems.push(format!(
                    "`{}` derives undeclared {}.{field}",
                    router.source(),
                    schema.name
                ));
            }
        }
    }
    problems
}
