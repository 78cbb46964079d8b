//! Routing strategies.
//!
//! A [`RoutingStrategy`] turns a [`RouteRequest`] into a waypoint list in the
//! local east/north frame. Strategies run off the pipeline thread, so they
//! must be `Send + Sync` and must not touch coordinator state.
//!
//! Built-in strategies:
//! - [`GridAStarStrategy`] – A* over an 8-connected occupancy grid (via the
//!   `pathfinding` crate) with obstacle zones inflated by a clearance margin.
//! - [`StraightLineStrategy`] – origin to destination, refused when the
//!   segment passes through an obstacle zone.

use drivecore_types::{DriveError, PlanningAlgorithm, Waypoint};
use pathfinding::prelude::astar;

/// Area to keep the route out of.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ObstacleZone {
    pub center: Waypoint,
    pub radius_m: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RouteRequest {
    pub origin: Waypoint,
    pub destination: Waypoint,
    pub obstacles: Vec<ObstacleZone>,
}

pub trait RoutingStrategy: Send + Sync {
    fn algorithm(&self) -> PlanningAlgorithm;

    /// Waypoints from `origin` to `destination`, both included.
    fn plan(&self, request: &RouteRequest) -> Result<Vec<Waypoint>, DriveError>;
}

// ────────────────────────────────────────────────────────────────────────────
// Grid A*
// ────────────────────────────────────────────────────────────────────────────

/// Fixed-point scale for step costs (the `pathfinding` A* needs integer costs).
const COST_SCALE: f64 = 1000.0;
const STRAIGHT_COST: u64 = 1000;
const DIAGONAL_COST: u64 = 1414;

type Cell = (i64, i64);

#[derive(Debug, Clone)]
pub struct GridAStarStrategy {
    pub cell_size_m: f64,
    /// Extra space around the origin/destination bounding box.
    pub padding_m: f64,
    /// Added to every obstacle radius.
    pub clearance_m: f64,
    pub max_cells: usize,
}

impl Default for GridAStarStrategy {
    fn default() -> Self {
        Self {
            cell_size_m: 1.0,
            padding_m: 20.0,
            clearance_m: 1.5,
            max_cells: 1_000_000,
        }
    }
}

struct Grid<'a> {
    origin_east: f64,
    origin_north: f64,
    cell: f64,
    cols: i64,
    rows: i64,
    zones: &'a [ObstacleZone],
    clearance: f64,
}

impl Grid<'_> {
    fn cell_of(&self, p: &Waypoint) -> Cell {
        (
            ((p.east_m - self.origin_east) / self.cell).round() as i64,
            ((p.north_m - self.origin_north) / self.cell).round() as i64,
        )
    }

    fn center(&self, (x, y): Cell) -> Waypoint {
        Waypoint::new(
            self.origin_east + x as f64 * self.cell,
            self.origin_north + y as f64 * self.cell,
        )
    }

    fn blocked(&self, c: Cell) -> bool {
        let p = self.center(c);
        self.zones
            .iter()
            .any(|z| p.distance_to(&z.center) <= z.radius_m + self.clearance)
    }

    fn successors(&self, (x, y): Cell) -> Vec<(Cell, u64)> {
        let mut out = Vec::with_capacity(8);
        for dx in -1..=1 {
            for dy in -1..=1 {
                if dx == 0 && dy == 0 {
                    continue;
                }
                let next = (x + dx, y + dy);
                if next.0 < 0 || next.1 < 0 || next.0 >= self.cols || next.1 >= self.rows {
                    continue;
                }
                if self.blocked(next) {
                    continue;
                }
                let cost = if dx != 0 && dy != 0 { DIAGONAL_COST } else { STRAIGHT_COST };
                out.push((next, cost));
            }
        }
        out
    }
}

/// Octile distance, admissible for 8-connected moves.
fn octile((ax, ay): Cell, (bx, by): Cell) -> u64 {
    let dx = (ax - bx).unsigned_abs();
    let dy = (ay - by).unsigned_abs();
    let (lo, hi) = if dx < dy { (dx, dy) } else { (dy, dx) };
    hi * STRAIGHT_COST + lo * (DIAGONAL_COST - STRAIGHT_COST)
}

/// Keep only the cells where the path changes direction.
fn corners(path: &[Cell]) -> Vec<Cell> {
    let dir = |a: Cell, b: Cell| (b.0 - a.0, b.1 - a.1);
    path.windows(3)
        .filter(|w| dir(w[0], w[1]) != dir(w[1], w[2]))
        .map(|w| w[1])
        .collect()
}

impl RoutingStrategy for GridAStarStrategy {
    fn algorithm(&self) -> PlanningAlgorithm {
        PlanningAlgorithm::AStar
    }

    fn plan(&self, request: &RouteRequest) -> Result<Vec<Waypoint>, DriveError> {
        let (o, d) = (request.origin, request.destination);
        let min_e = o.east_m.min(d.east_m) - self.padding_m;
        let min_n = o.north_m.min(d.north_m) - self.padding_m;
        let span_e = (o.east_m - d.east_m).abs() + 2.0 * self.padding_m;
        let span_n = (o.north_m - d.north_m).abs() + 2.0 * self.padding_m;

        let cols = (span_e / self.cell_size_m).ceil() as i64 + 1;
        let rows = (span_n / self.cell_size_m).ceil() as i64 + 1;
        if cols.saturating_mul(rows) as usize > self.max_cells {
            return Err(DriveError::Routing(format!(
                "search grid {cols}×{rows} exceeds {} cells",
                self.max_cells
            )));
        }

        let grid = Grid {
            origin_east: min_e,
            origin_north: min_n,
            cell: self.cell_size_m,
            cols,
            rows,
            zones: &request.obstacles,
            clearance: self.clearance_m,
        };
        let start = grid.cell_of(&o);
        let goal = grid.cell_of(&d);
        if grid.blocked(goal) {
            return Err(DriveError::Routing("destination is inside an obstacle zone".into()));
        }

        let (path, cost) = astar(
            &start,
            |c| grid.successors(*c),
            |c| octile(*c, goal),
            |c| *c == goal,
        )
        .ok_or_else(|| DriveError::Routing("no collision-free path to destination".into()))?;

        tracing::debug!(
            cells = path.len(),
            length_m = cost as f64 / COST_SCALE * self.cell_size_m,
            "grid A* route found"
        );

        let mut waypoints = Vec::with_capacity(path.len());
        waypoints.push(o);
        waypoints.extend(corners(&path).into_iter().map(|c| grid.center(c)));
        if o != d {
            waypoints.push(d);
        }
        Ok(waypoints)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Straight line
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct StraightLineStrategy {
    pub clearance_m: f64,
}

impl Default for StraightLineStrategy {
    fn default() -> Self {
        Self { clearance_m: 1.5 }
    }
}

/// Distance from `p` to the segment `a`–`b`.
fn segment_distance(p: &Waypoint, a: &Waypoint, b: &Waypoint) -> f64 {
    let (dx, dy) = (b.east_m - a.east_m, b.north_m - a.north_m);
    let len2 = dx * dx + dy * dy;
    if len2 == 0.0 {
        return p.distance_to(a);
    }
    let t = (((p.east_m - a.east_m) * dx + (p.north_m - a.north_m) * dy) / len2).clamp(0.0, 1.0);
    p.distance_to(&Waypoint::new(a.east_m + t * dx, a.north_m + t * dy))
}

impl RoutingStrategy for StraightLineStrategy {
    fn algorithm(&self) -> PlanningAlgorithm {
        PlanningAlgorithm::StraightLine
    }

    fn plan(&self, request: &RouteRequest) -> Result<Vec<Waypoint>, DriveError> {
        let (o, d) = (request.origin, request.destination);
        if let Some(zone) = request
            .obstacles
            .iter()
            .find(|z| segment_distance(&z.center, &o, &d) <= z.radius_m + self.clearance_m)
        {
            return Err(DriveError::Routing(format!(
                "straight line blocked near ({:.1}, {:.1})",
                zone.center.east_m, zone.center.north_m
            )));
        }
        Ok(vec![o, d])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drivecore_types::path_length;

    fn request(obstacles: Vec<ObstacleZone>) -> RouteRequest {
        RouteRequest {
            origin: Waypoint::new(0.0, 0.0),
            destination: Waypoint::new(30.0, 0.0),
            obstacles,
        }
    }

    fn wall() -> Vec<ObstacleZone> {
        vec![ObstacleZone {
            center: Waypoint::new(15.0, 0.0),
            radius_m: 3.0,
        }]
    }

    #[test]
    fn straight_line_on_open_road() {
        let route = StraightLineStrategy::default().plan(&request(vec![])).unwrap();
        assert_eq!(route, vec![Waypoint::new(0.0, 0.0), Waypoint::new(30.0, 0.0)]);
    }

    #[test]
    fn straight_line_refuses_blocked_segment() {
        let err = StraightLineStrategy::default().plan(&request(wall())).unwrap_err();
        assert!(matches!(err, DriveError::Routing(_)));
    }

    #[test]
    fn astar_open_road_is_direct() {
        let route = GridAStarStrategy::default().plan(&request(vec![])).unwrap();
        assert_eq!(route.first(), Some(&Waypoint::new(0.0, 0.0)));
        assert_eq!(route.last(), Some(&Waypoint::new(30.0, 0.0)));
        assert!((path_length(&route) - 30.0).abs() < 1e-9);
    }

    #[test]
    fn astar_detours_around_obstacle() {
        let strategy = GridAStarStrategy::default();
        let zones = wall();
        let route = strategy.plan(&request(zones.clone())).unwrap();
        assert!(route.len() > 2);
        assert!(path_length(&route) > 30.0);
        for w in &route[1..route.len() - 1] {
            assert!(w.distance_to(&zones[0].center) > zones[0].radius_m + strategy.clearance_m);
        }
    }

    #[test]
    fn astar_rejects_blocked_destination() {
        let mut req = request(wall());
        req.destination = Waypoint::new(15.0, 1.0);
        assert!(GridAStarStrategy::default().plan(&req).is_err());
    }

    #[test]
    fn astar_rejects_oversized_grid() {
        let strategy = GridAStarStrategy {
            max_cells: 100,
            ..GridAStarStrategy::default()
        };
        assert!(strategy.plan(&request(vec![])).is_err());
    }

    #[test]
    fn octile_heuristic_matches_step_costs() {
        assert_eq!(octile((0, 0), (3, 0)), 3 * STRAIGHT_COST);
        assert_eq!(octile((0, 0), (2, 2)), 2 * DIAGONAL_COST);
    }
}
