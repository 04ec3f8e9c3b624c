//! Fan-out arguments and per-vehicle outcome reports.

use std::fmt;

/// How a dispatched action runs on each vehicle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    /// Run now, concurrently with anything else on the vehicle
    Execute,
    /// Queue behind earlier scheduled actions on the vehicle
    Schedule,
}

/// One argument of a fan-out: the same value for every vehicle, or one
/// value per vehicle in name order.
#[derive(Debug, Clone, PartialEq)]
pub enum Arg<T> {
    Shared(T),
    PerVehicle(Vec<T>),
}

/// A bundle of [`Arg`]s split into one item per vehicle.
pub trait FanOut {
    type Item: Send + 'static;

    /// Length of the first per-vehicle list that does not match `count`.
    fn mismatch(&self, count: usize) -> Option<usize>;

    /// Split into exactly `count` items. Call only after `mismatch`
    /// returned `None`.
    fn split(self, count: usize) -> Vec<Self::Item>;
}

impl FanOut for () {
    type Item = ();

    fn mismatch(&self, _count: usize) -> Option<usize> {
        None
    }

    fn split(self, count: usize) -> Vec<()> {
        vec![(); count]
    }
}

impl<T: Clone + Send + 'static> FanOut for Arg<T> {
    type Item = T;

    fn mismatch(&self, count: usize) -> Option<usize> {
        match self {
            Arg::PerVehicle(values) if values.len() != count => Some(values.len()),
            _ => None,
        }
    }

    fn split(self, count: usize) -> Vec<T> {
        match self {
            Arg::Shared(value) => vec![value; count],
            Arg::PerVehicle(values) => values,
        }
    }
}

impl<A: FanOut, B: FanOut> FanOut for (A, B) {
    type Item = (A::Item, B::Item);

    fn mismatch(&self, count: usize) -> Option<usize> {
        self.0.mismatch(count).or_else(|| self.1.mismatch(count))
    }

    fn split(self, count: usize) -> Vec<Self::Item> {
        self.0
            .split(count)
            .into_iter()
            .zip(self.1.split(count))
            .collect()
    }
}

impl<A: FanOut, B: FanOut, C: FanOut> FanOut for (A, B, C) {
    type Item = (A::Item, B::Item, C::Item);

    fn mismatch(&self, count: usize) -> Option<usize> {
        self.0
            .mismatch(count)
            .or_else(|| self.1.mismatch(count))
            .or_else(|| self.2.mismatch(count))
    }

    fn split(self, count: usize) -> Vec<Self::Item> {
        self.0
            .split(count)
            .into_iter()
            .zip(self.1.split(count))
            .zip(self.2.split(count))
            .map(|((a, b), c)| (a, b, c))
            .collect()
    }
}

/// Outcome of one fan-out, per vehicle, in dispatch order.
#[derive(Debug)]
pub struct DispatchReport<T = ()> {
    pub action: String,
    pub outcomes: Vec<(String, anyhow::Result<T>)>,
}

impl<T> DispatchReport<T> {
    pub fn all_ok(&self) -> bool {
        self.outcomes.iter().all(|(_, r)| r.is_ok())
    }

    pub fn succeeded(&self) -> impl Iterator<Item = &str> {
        self.outcomes
            .iter()
            .filter(|(_, r)| r.is_ok())
            .map(|(name, _)| name.as_str())
    }

    pub fn failed(&self) -> impl Iterator<Item = (&str, &anyhow::Error)> {
        self.outcomes
            .iter()
            .filter_map(|(name, r)| r.as_ref().err().map(|e| (name.as_str(), e)))
    }

    pub fn get(&self, name: &str) -> Option<&anyhow::Result<T>> {
        self.outcomes
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, r)| r)
    }

    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }
}

impl<T> fmt::Display for DispatchReport<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ok = self.succeeded().count();
        write!(f, "{}: {}/{} ok", self.action, ok, self.outcomes.len())?;
        for (name, error) in self.failed() {
            write!(f, "; {name}: {error:#}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn test_shared_and_per_vehicle_split() {
        let args = (Arg::Shared(2.5f32), Arg::PerVehicle(vec!["a", "b", "c"]));
        assert_eq!(args.mismatch(3), None);
        assert_eq!(args.split(3), vec![(2.5, "a"), (2.5, "b"), (2.5, "c")]);
    }

    #[test]
    fn test_mismatch_reports_first_bad_list() {
        let args = (
            Arg::PerVehicle(vec![1, 2]),
            Arg::Shared(0),
            Arg::PerVehicle(vec![1]),
        );
        assert_eq!(args.mismatch(2), Some(1));
        assert_eq!(args.mismatch(3), Some(2));
        assert_eq!(().mismatch(7), None);
    }

    #[test]
    fn test_report_summary() {
        let report = DispatchReport {
            action: "arm".to_string(),
            outcomes: vec![
                ("a".to_string(), Ok(())),
                ("b".to_string(), Err(anyhow!("rejected"))),
            ],
        };
        assert!(!report.all_ok());
        assert_eq!(report.succeeded().collect::<Vec<_>>(), vec!["a"]);
        assert_eq!(report.to_string(), "arm: 1/2 ok; b: rejected");
        assert!(report.get("b").unwrap().is_err());
    }
}
