use super::Coord;

pub trait RingContainment {
    fn contains(&self, outer: &[Coord], inner: &[Coord]) -> bool;
    fn intersects(&self, a: &[Coord], b: &[Coord]) -> bool;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct CrossingNumber;

impl RingContainment for CrossingNumber {
    fn contains(&self, outer: &[Coord], inner: &[Coord]) -> bool {
        match inner.first() {
            Some(first) => !rings_intersect(outer, inner) && ring_contains_point(outer, *first),
            None => false,
        }
    }

    fn intersects(&self, a: &[Coord], b: &[Coord]) -> bool {
        rings_intersect(a, b)
    }
}

pub type PolygonRings = Vec<Vec<Coord>>;

pub fn close_ring(mut ring: Vec<Coord>) -> Vec<Coord> {
    if let (Some(first), Some(last)) = (ring.first().copied(), ring.last().copied()) {
        if first != last {
            ring.push(first);
        }
    }
    ring
}

pub fn is_clockwise(ring: &[Coord]) -> bool {
    let total: f64 = ring
        .windows(2)
        .map(|edge| (edge[1][0] - edge[0][0]) * (edge[1][1] + edge[0][1]))
        .sum();
    total >= 0.0
}

/// Groups raw Esri rings into polygons.
///
/// Rings shorter than four points after closing are dropped. Holes that no
/// shell contains are attached to the first shell they cross; a hole that
/// touches nothing is reversed and promoted to a shell of its own.
pub fn group_rings<C: RingContainment>(rings: &[Vec<Coord>], containment: &C) -> Vec<PolygonRings> {
    let mut polygons: Vec<PolygonRings> = Vec::new();
    let mut holes: Vec<Vec<Coord>> = Vec::new();

    for raw in rings {
        let ring = close_ring(raw.clone());
        if ring.len() < 4 {
            continue;
        }
        if is_clockwise(&ring) {
            polygons.push(vec![ring]);
        } else {
            holes.push(ring);
        }
    }

    let mut uncontained = Vec::new();
    while let Some(hole) = holes.pop() {
        let shell = polygons
            .iter()
            .rposition(|polygon| containment.contains(&polygon[0], &hole));
        match shell {
            Some(index) => polygons[index].push(hole),
            None => uncontained.push(hole),
        }
    }

    while let Some(mut hole) = uncontained.pop() {
        let shell = polygons
            .iter()
            .rposition(|polygon| containment.intersects(&polygon[0], &hole));
        match shell {
            Some(index) => polygons[index].push(hole),
            None => {
                hole.reverse();
                polygons.push(vec![hole]);
            }
        }
    }

    polygons
}

fn edges_intersect(a1: Coord, a2: Coord, b1: Coord, b2: Coord) -> bool {
    let a = [a2[0] - a1[0], a2[1] - a1[1]];
    let b = [b2[0] - b1[0], b2[1] - b1[1]];
    let u = [a1[0] - b1[0], a1[1] - b1[1]];

    let denom = b[1] * a[0] - b[0] * a[1];
    if denom == 0.0 {
        return false;
    }

    let ua = (b[0] * u[1] - b[1] * u[0]) / denom;
    let ub = (a[0] * u[1] - a[1] * u[0]) / denom;
    (0.0..=1.0).contains(&ua) && (0.0..=1.0).contains(&ub)
}

fn rings_intersect(a: &[Coord], b: &[Coord]) -> bool {
    a.windows(2).any(|ea| {
        b.windows(2)
            .any(|eb| edges_intersect(ea[0], ea[1], eb[0], eb[1]))
    })
}

fn ring_contains_point(ring: &[Coord], point: Coord) -> bool {
    let mut contains = false;
    let Some(mut previous) = ring.last().copied() else {
        return false;
    };

    for &current in ring {
        let spans_y = (current[1] <= point[1] && point[1] < previous[1])
            || (previous[1] <= point[1] && point[1] < current[1]);
        if spans_y {
            let x_at = (point[1] - current[1]) * (previous[0] - current[0])
                / (previous[1] - current[1])
                + current[0];
            if point[0] < x_at {
                contains = !contains;
            }
        }
        previous = current;
    }

    contains
}
