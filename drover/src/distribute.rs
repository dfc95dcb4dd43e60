use itertools::Itertools;
use rand::Rng;
use tracing::debug;

/// Cost of one pair of buckets, given their total weights and slot counts.
///
/// The squared terms punish overloading a node, and do so convexly, so
/// piling all the overload onto one node costs more than spreading it. The
/// ratio terms punish leaving a capable node under-filled.
pub fn pair_cost(load1: f64, slots1: f64, load2: f64, slots2: f64) -> f64 {
    (load1 - slots1).max(0.0).powi(2)
        + (load2 - slots2).max(0.0).powi(2)
        + slots1 / load1.max(1.0)
        + slots2 / load2.max(1.0)
}

/// A partition of job indices into one bucket per node.
pub struct Distribution {
    pub buckets: Vec<Vec<usize>>,
}

enum Change {
    Swap { other: usize, other_weight: f64 },
    Move,
}

/// Deal each job into a uniformly random bucket, one bucket per node.
pub fn initial_assignment(rng: &mut impl Rng, jobs: usize, nodes: usize) -> Vec<Vec<usize>> {
    let mut buckets: Vec<Vec<usize>> = vec![Vec::new(); nodes];
    for job in 0..jobs {
        buckets[rng.gen_range(0..nodes)].push(job);
    }
    buckets
}

/// Improve a partition by hill climbing on pairs of buckets.
///
/// Each trial picks two distinct buckets and a random job from the first,
/// then evaluates swapping it against a random job from the second and
/// moving it over outright. The cheaper candidate is applied if it strictly
/// lowers the pair's cost, with a swap winning ties. The search stops after
/// 100 fruitless trials in a row; drawing an empty source bucket only
/// counts a tenth, since that signals thinning work rather than rejection.
///
/// Accepted changes strictly lower the cost of the pair they touch and
/// leave all other buckets untouched, so the settled partition never costs
/// more than the one it started from.
pub fn climb(
    rng: &mut impl Rng,
    mut buckets: Vec<Vec<usize>>,
    weights: &[f64],
    slots: &[f64],
) -> Vec<Vec<usize>> {
    let nodes = slots.len();
    if nodes < 2 {
        return buckets;
    }
    let mut loads: Vec<f64> = buckets
        .iter()
        .map(|bucket| bucket.iter().map(|&job| weights[job]).sum())
        .collect();

    let mut reject_spree = 0.0_f64;
    let mut steps = 0_u64;
    while reject_spree < 100.0 {
        let first = rng.gen_range(0..nodes);
        let mut second = rng.gen_range(0..nodes - 1);
        if second >= first {
            second += 1;
        }
        if buckets[first].is_empty() {
            reject_spree += 0.1;
            continue;
        }
        steps += 1;

        let chosen = rng.gen_range(0..buckets[first].len());
        let chosen_weight = weights[buckets[first][chosen]];
        let current = pair_cost(loads[first], slots[first], loads[second], slots[second]);

        let mut best: Option<(Change, f64)> = None;
        if !buckets[second].is_empty() {
            let other = rng.gen_range(0..buckets[second].len());
            let other_weight = weights[buckets[second][other]];
            let cost = pair_cost(
                loads[first] - chosen_weight + other_weight,
                slots[first],
                loads[second] - other_weight + chosen_weight,
                slots[second],
            );
            if cost < current {
                best = Some((Change::Swap { other, other_weight }, cost));
            }
        }
        if current > 0.0 {
            let cost = pair_cost(
                loads[first] - chosen_weight,
                slots[first],
                loads[second] + chosen_weight,
                slots[second],
            );
            // a move has to beat the swap outright, ties keep the swap
            let to_beat = best.as_ref().map_or(current, |(_, cost)| *cost);
            if cost < to_beat {
                best = Some((Change::Move, cost));
            }
        }

        match best {
            Some((Change::Swap { other, other_weight }, _)) => {
                let out = buckets[first][chosen];
                buckets[first][chosen] = buckets[second][other];
                buckets[second][other] = out;
                loads[first] += other_weight - chosen_weight;
                loads[second] += chosen_weight - other_weight;
                reject_spree = 0.0;
            }
            Some((Change::Move, _)) => {
                let job = buckets[first].swap_remove(chosen);
                buckets[second].push(job);
                loads[first] -= chosen_weight;
                loads[second] += chosen_weight;
                reject_spree = 0.0;
            }
            None => reject_spree += 1.0,
        }
    }
    debug!("distribution settled after {steps} trials");

    buckets
}

/// Spread jobs over nodes by hill climbing from a random assignment.
///
/// The result is a single-swap/single-move local optimum, not a globally
/// optimal packing.
pub fn distribute(weights: &[f64], slots: &[f64]) -> Distribution {
    let nodes = slots.len();
    if nodes == 0 {
        return Distribution {
            buckets: Vec::new(),
        };
    }
    if weights.is_empty() {
        return Distribution {
            buckets: vec![Vec::new(); nodes],
        };
    }
    if nodes < 2 {
        return Distribution {
            buckets: vec![(0..weights.len()).collect()],
        };
    }
    debug!(
        "distributing {} jobs with weight {} over {} slots",
        weights.len(),
        weights.iter().sum::<f64>(),
        slots.iter().sum::<f64>()
    );

    let mut rng = rand::thread_rng();
    let start = initial_assignment(&mut rng, weights.len(), nodes);
    Distribution {
        buckets: climb(&mut rng, start, weights, slots),
    }
}

impl Distribution {
    /// One bar per node: `+` and a final `x` per job while under capacity,
    /// `1` and `!` once over it, `_` for leftover slots, then the job
    /// names. Idle nodes are summarized in a single trailing line.
    pub fn render(
        &self,
        labels: &[&str],
        weights: &[f64],
        nodes: &[String],
        slots: &[f64],
    ) -> String {
        let mut lines = Vec::new();
        let mut idle = Vec::new();

        let heaviest = self
            .buckets
            .iter()
            .map(|bucket| bucket.iter().map(|&job| weights[job]).sum::<f64>())
            .fold(0.0_f64, f64::max);
        let first_slot = slots.first().copied().unwrap_or(0.0);
        let width = if first_slot.is_finite() {
            heaviest.max(first_slot) + 8.0
        } else {
            heaviest + 8.0
        };

        for (node, bucket) in self.buckets.iter().enumerate() {
            if bucket.is_empty() {
                idle.push(nodes[node].as_str());
                continue;
            }
            let capacity = slots[node];
            let mut bar = String::new();
            let mut used = 0_i64;
            for &job in bucket {
                let units = (weights[job] - 1.0).round().max(0.0) as i64;
                for _ in 0..units {
                    used += 1;
                    bar.push(if (used as f64) < capacity { '+' } else { '1' });
                }
                used += 1;
                bar.push(if (used as f64) < capacity { 'x' } else { '!' });
            }
            if capacity.is_finite() {
                let free = (capacity - used as f64).round() as i64;
                for _ in 0..free.max(0) {
                    bar.push('_');
                }
            }
            let pad = (width - bar.len() as f64).max(0.0) as usize;
            bar.push_str(&" ".repeat(pad));

            let names = bucket.iter().map(|&job| labels[job]).join(", ");
            let names = if names.len() <= 30 {
                names
            } else {
                format!("{}...", &names[..27])
            };
            lines.push(format!("{:>5}: {bar}{names}", nodes[node]));
        }

        if !idle.is_empty() {
            lines.push(format!("no jobs on {} nodes: {}", idle.len(), idle.join(", ")));
        }
        lines.join("\n")
    }
}
