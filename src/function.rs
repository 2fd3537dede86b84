//! Function algebra on trees.
use crate::builder::copy_grid;
use crate::index::NodeIndex;
use crate::node::NodeStatus;
use crate::transform::{coefs_to_values, cv_transform, mw_transform, values_to_coefs};
use crate::tree::MwTree;
use crate::types::{
    CvTransformType, MwError, MwTransformType, Result, ScalingType, TraverseDirection,
    TraverseOrder,
};
use log::warn;
use rayon::prelude::*;

impl<const D: usize> MwTree<D> {
    fn check_compatible(&self, other: &Self) -> Result<()> {
        if self.mra().is_compatible(other.mra()) {
            Ok(())
        } else {
            Err(MwError::IncompatibleTrees(format!(
                "{:?} and {:?} are built on different analyses",
                self.name(),
                other.name()
            )))
        }
    }

    /// Integral of the represented function over the world box, from the scaling blocks of the
    /// roots.
    pub fn integrate(&self) -> f64 {
        self.root_box()
            .roots()
            .iter()
            .filter(|serial| self.node(**serial).has_coefs())
            .map(|serial| {
                self.basis()
                    .integrate_expansion::<D>(self.coef_block(*serial, 0), self.node(*serial).scale())
            })
            .sum()
    }

    /// Inner product `<self|ket>`.
    ///
    /// Scaling blocks of the roots and wavelet blocks of the nodes present in both trees
    /// contribute; the trees need not share a grid.
    pub fn dot(&self, ket: &Self) -> Result<f64> {
        self.check_compatible(ket)?;
        let kd = self.layout().kp1_d;
        let mut result = 0.0;
        for serial in self.iter(TraverseDirection::TopDown, TraverseOrder::Hilbert) {
            let bra = self.node(serial);
            if !bra.has_coefs() {
                continue;
            }
            let Some(other) = ket.find_node(bra.index()) else {
                continue;
            };
            if !ket.node(other).has_coefs() {
                continue;
            }
            let start = if bra.is_root() { 0 } else { kd };
            result += self.coefs(serial)[start..]
                .iter()
                .zip(&ket.coefs(other)[start..])
                .map(|(a, b)| a * b)
                .sum::<f64>();
        }
        Ok(result)
    }

    /// Value at the point `r`, zero outside the world box.
    pub fn evalf(&self, r: &[f64; D]) -> f64 {
        let Some(serial) = self.get_node_or_end_node_at(r, self.mra().max_scale()) else {
            return 0.0;
        };
        if !self.node(serial).has_coefs() {
            return 0.0;
        }
        let mut loose = self.loose_copy(serial);
        self.with_scratch(|scratch| {
            loose.mw_transform(self.filter(), MwTransformType::Reconstruction, scratch)
        });
        loose.evalf(self.basis(), r)
    }

    /// Multiply by `c`.
    pub fn rescale(&mut self, c: f64) {
        self.delete_generated();
        let kd = self.layout().kp1_d;
        self.arena
            .nodes
            .par_nodes_mut()
            .filter(|(node, _)| node.has_coefs())
            .for_each(|(node, coefs)| {
                coefs.iter_mut().for_each(|value| *value *= c);
                node.calc_norms(coefs, kd);
            });
        self.invalidate_square_norm();
    }

    /// Scale to unit norm. A zero function is left unchanged.
    pub fn normalize(&mut self) {
        let norm = self.square_norm().sqrt();
        if norm == 0.0 {
            warn!("cannot normalize {:?}: the function is zero", self.name());
            return;
        }
        self.rescale(1.0 / norm);
    }

    /// Add `c other`, refining to the union of both grids.
    pub fn add(&mut self, c: f64, other: &Self) -> Result<()> {
        self.check_compatible(other)?;
        self.delete_generated();
        copy_grid(self, other)?;

        self.arena
            .nodes
            .par_nodes_mut()
            .filter(|(node, _)| !node.has_coefs())
            .for_each(|(node, coefs)| {
                coefs.fill(0.0);
                node.status
                    .insert(NodeStatus::HAS_COEFS | NodeStatus::HAS_WCOEFS);
                node.zero_norms();
            });

        let kd = self.layout().kp1_d;
        for serial in other.iter(TraverseDirection::TopDown, TraverseOrder::ZOrder) {
            let source = other.node(serial);
            if !source.has_coefs() {
                continue;
            }
            let target = self
                .find_node(source.index())
                .unwrap_or_else(|| panic!("{} missing after copying the grid", source.index()));
            let start = if source.is_root() { 0 } else { kd };
            let (node, coefs) = self.arena.nodes.node_and_coefs_mut(target);
            coefs[start..]
                .iter_mut()
                .zip(&other.coefs(serial)[start..])
                .for_each(|(a, b)| *a += c * b);
            node.calc_norms(coefs, kd);
        }

        self.mw_transform(TraverseDirection::TopDown, true);
        Ok(())
    }

    /// Remove the component along `other`: `self -= (<other|self> / <other|other>) other`.
    pub fn orthogonalize(&mut self, other: &Self) -> Result<()> {
        let overlap = other.dot(self)?;
        let norm = other.square_norm();
        if norm == 0.0 {
            warn!("cannot orthogonalize against {:?}: the function is zero", other.name());
            return Ok(());
        }
        self.add(-overlap / norm, other)
    }

    /// Multiply pointwise by `other` on the union of both grids, without further refinement.
    pub fn multiply(&mut self, other: &Self) -> Result<()> {
        self.check_compatible(other)?;
        copy_grid(self, other)?;
        self.map_end_values(Some(other), |a, b| a * b);
        Ok(())
    }

    /// Square pointwise on the current grid.
    pub fn square(&mut self) {
        self.map_end_values(None, |a, _| a * a);
    }

    /// Raise to the power `p` pointwise on the current grid.
    pub fn power(&mut self, p: f64) {
        self.map_end_values(None, |a, _| a.powf(p));
    }

    /// Function values at the quadrature points of the children of a node at `scale`.
    fn nodal_values(&self, coefs: &[f64], scale: i32) -> Vec<f64> {
        let mut values = self.reconstruct(coefs);
        coefs_to_values::<D>(&mut values, self.basis(), scale);
        values
    }

    /// Coefficients of the node `idx`, interpolated from the end node above it when `idx` lies
    /// below the grid. Nothing is generated.
    fn interpolated_coefs(&self, idx: &NodeIndex<D>) -> Vec<f64> {
        let serial = self
            .get_node_or_end_node(idx)
            .unwrap_or_else(|| panic!("{idx} outside the world box"));
        let node = self.node(serial);
        assert!(
            node.has_coefs(),
            "interpolation from {} without coefficients",
            node.index()
        );
        let kd = self.layout().kp1_d;
        let mut index = *node.index();
        let mut coefs = self.coefs(serial).to_vec();
        while index.scale() < idx.scale() {
            let child = index.child_slot_towards(idx);
            coefs = self.reconstruct(&coefs)[child * kd..(child + 1) * kd].to_vec();
            index = index.child(child);
        }
        coefs
    }

    fn map_end_values(&mut self, other: Option<&Self>, op: impl Fn(f64, f64) -> f64 + Sync) {
        self.delete_generated();
        let end_nodes = self.end_nodes().to_vec();
        let this = &*self;
        let results: Vec<Vec<f64>> = end_nodes
            .par_iter()
            .map(|serial| {
                let node = this.node(*serial);
                assert!(
                    node.has_coefs(),
                    "pointwise operation on {} without coefficients",
                    node.index()
                );
                let mut values = this.nodal_values(this.coefs(*serial), node.scale());
                match other {
                    Some(other) => {
                        let factors = other
                            .nodal_values(&other.interpolated_coefs(node.index()), node.scale());
                        values
                            .iter_mut()
                            .zip(&factors)
                            .for_each(|(a, b)| *a = op(*a, *b));
                    }
                    None => values.iter_mut().for_each(|a| *a = op(*a, 0.0)),
                }
                values_to_coefs::<D>(&mut values, this.basis(), node.scale());
                this.with_scratch(|scratch| {
                    mw_transform::<D>(&mut values, scratch, this.filter(), MwTransformType::Compression);
                });
                values
            })
            .collect();
        for (serial, data) in end_nodes.iter().zip(&results) {
            self.write_compressed(*serial, data, true);
        }
        self.mw_transform(TraverseDirection::BottomUp, true);
    }

    /// Function values at the quadrature points of the children of every end node, in end table
    /// order. Only defined for interpolating bases.
    pub fn end_values(&self) -> Result<Vec<f64>> {
        self.require_interpolating()?;
        let mut values = Vec::with_capacity(self.n_end_nodes() * self.layout().node_stride);
        for serial in self.end_nodes() {
            let mut loose = self.loose_copy(*serial);
            self.with_scratch(|scratch| {
                loose.mw_transform(self.filter(), MwTransformType::Reconstruction, scratch)
            });
            loose.cv_transform(self.basis(), CvTransformType::Backward)?;
            values.extend_from_slice(loose.coefs());
        }
        Ok(values)
    }

    /// Overwrite the end nodes from values laid out as by [`end_values`](Self::end_values), then
    /// compress the tree bottom-up.
    pub fn set_end_values(&mut self, values: &[f64]) -> Result<()> {
        self.require_interpolating()?;
        let stride = self.layout().node_stride;
        let expected = self.n_end_nodes() * stride;
        if values.len() != expected {
            return Err(MwError::LayoutMismatch(format!(
                "{} end values given, {expected} expected",
                values.len()
            )));
        }
        self.delete_generated();
        for (i, serial) in self.end_nodes().to_vec().into_iter().enumerate() {
            let mut data = values[i * stride..(i + 1) * stride].to_vec();
            cv_transform::<D>(
                &mut data,
                self.basis(),
                self.node(serial).scale(),
                CvTransformType::Forward,
            )?;
            self.with_scratch(|scratch| {
                mw_transform::<D>(&mut data, scratch, self.filter(), MwTransformType::Compression)
            });
            self.write_compressed(serial, &data, true);
        }
        self.mw_transform(TraverseDirection::BottomUp, true);
        Ok(())
    }

    fn require_interpolating(&self) -> Result<()> {
        match self.basis().scaling_type() {
            ScalingType::Interpolating => Ok(()),
            other => Err(MwError::UnsupportedBasis(other)),
        }
    }
}

#[cfg(test)]
mod test {
    use crate::basis::ScalingBasis;
    use crate::builder::{build_grid, project};
    use crate::mra::{BoundingBox, MultiResolutionAnalysis};
    use crate::tree::MwTree;
    use crate::types::MwError;
    use approx::*;

    fn tree<const D: usize>(basis: ScalingBasis) -> MwTree<D> {
        MwTree::new(MultiResolutionAnalysis::with_max_scale(BoundingBox::unit(), basis, 12).unwrap())
    }

    fn legendre<const D: usize>() -> MwTree<D> {
        tree(ScalingBasis::legendre(3).unwrap())
    }

    #[test]
    fn test_integrate_and_evaluate() {
        let mut f = legendre::<2>();
        project(&mut f, 1e-10, false, |r| 1.0 + r[0] * r[1] - r[1].powi(3));
        assert_relative_eq!(f.integrate(), 1.0, epsilon = 1e-12);
        assert_relative_eq!(f.evalf(&[0.3, 0.7]), 1.0 + 0.21 - 0.343, epsilon = 1e-12);
        assert_eq!(f.evalf(&[1.5, 0.5]), 0.0);
    }

    #[test]
    fn test_dot_matches_square_norm() {
        let mut f = legendre::<1>();
        project(&mut f, 1e-8, false, |r| (-50.0 * (r[0] - 0.5).powi(2)).exp());
        assert!(f.n_nodes() > 1);
        assert_relative_eq!(f.dot(&f).unwrap(), f.square_norm(), epsilon = 1e-12);
        let exact = (std::f64::consts::PI / 100.0).sqrt();
        assert_relative_eq!(f.square_norm(), exact, epsilon = 1e-7);

        let mut g = legendre::<1>();
        project(&mut g, 1e-8, false, |_| 1.0);
        assert_relative_eq!(f.dot(&g).unwrap(), f.integrate(), epsilon = 1e-10);
        assert_relative_eq!(g.dot(&f).unwrap(), f.integrate(), epsilon = 1e-10);
    }

    #[test]
    fn test_add_and_rescale() {
        let mut f = legendre::<1>();
        let mut g = legendre::<1>();
        project(&mut f, 1e-8, false, |r| r[0]);
        project(&mut g, 1e-8, false, |r| (10.0 * r[0]).sin());
        f.add(2.0, &g).unwrap();
        for x in [0.1, 0.45, 0.9] {
            assert_relative_eq!(f.evalf(&[x]), x + 2.0 * (10.0 * x).sin(), epsilon = 1e-6);
        }
        f.rescale(-1.0);
        assert_relative_eq!(f.evalf(&[0.25]), -0.25 - 2.0 * 2.5f64.sin(), epsilon = 1e-6);

        let c = tree::<1>(ScalingBasis::interpolating(3).unwrap());
        assert!(matches!(f.add(1.0, &c), Err(MwError::IncompatibleTrees(_))));
    }

    #[test]
    fn test_normalize_and_orthogonalize() {
        let mut f = legendre::<1>();
        let mut g = legendre::<1>();
        project(&mut f, 1e-10, false, |r| 1.0 + r[0]);
        project(&mut g, 1e-10, false, |_| 1.0);
        f.orthogonalize(&g).unwrap();
        assert!(f.dot(&g).unwrap().abs() < 1e-12);
        f.normalize();
        assert_relative_eq!(f.square_norm(), 1.0, epsilon = 1e-12);

        let mut zero = legendre::<1>();
        project(&mut zero, 1e-10, false, |_| 0.0);
        zero.normalize();
        assert_eq!(zero.square_norm(), 0.0);
    }

    #[test]
    fn test_pointwise_operations() {
        let mut f = legendre::<1>();
        let mut g = legendre::<1>();
        build_grid(&mut g, 1);
        project(&mut f, 1e-10, false, |r| r[0]);
        project(&mut g, -1.0, false, |r| 1.0 - r[0]);
        f.multiply(&g).unwrap();
        assert_eq!(f.n_nodes(), 3);
        assert_relative_eq!(f.evalf(&[0.3]), 0.3 * 0.7, epsilon = 1e-12);

        let mut fine = legendre::<1>();
        build_grid(&mut fine, 2);
        project(&mut fine, -1.0, false, |r| r[0]);
        fine.multiply(&g).unwrap();
        assert_eq!(fine.n_nodes(), 7);
        assert_eq!(g.n_gen_nodes(), 0);
        assert_relative_eq!(fine.evalf(&[0.3]), 0.3 * 0.7, epsilon = 1e-12);

        let mut p = legendre::<1>();
        project(&mut p, 1e-10, false, |r| 1.0 + r[0]);
        p.square();
        assert_eq!(p.n_nodes(), 1);
        assert_relative_eq!(p.evalf(&[0.6]), 1.6 * 1.6, epsilon = 1e-12);

        let mut h = legendre::<1>();
        project(&mut h, 1e-10, false, |r| r[0] * r[0]);
        h.power(0.5);
        assert_relative_eq!(h.evalf(&[0.8]), 0.8, epsilon = 1e-12);
    }

    #[test]
    fn test_end_values() {
        let mut f = tree::<2>(ScalingBasis::interpolating(2).unwrap());
        build_grid(&mut f, 1);
        project(&mut f, -1.0, false, |r| 1.0 + r[0] - 2.0 * r[1]);
        let values = f.end_values().unwrap();
        assert_eq!(values.len(), 4 * 4 * 9);

        let points = f.basis().quadrature_points().to_vec();
        let first = f.end_node(0);
        let index = *f.node(first).index();
        let child = index.child(1);
        let width = 2f64.powi(-child.scale());
        let x = width * (f64::from(child.translation()[0]) + points[2]);
        let y = width * (f64::from(child.translation()[1]) + points[0]);
        assert_relative_eq!(values[9 + 2], 1.0 + x - 2.0 * y, epsilon = 1e-12);

        let doubled: Vec<f64> = values.iter().map(|v| 2.0 * v).collect();
        f.set_end_values(&doubled).unwrap();
        assert_relative_eq!(f.evalf(&[0.2, 0.9]), 2.0 * (1.0 + 0.2 - 1.8), epsilon = 1e-12);
        assert!(matches!(
            f.set_end_values(&doubled[1..]),
            Err(MwError::LayoutMismatch(_))
        ));

        let g = legendre::<2>();
        assert!(matches!(g.end_values(), Err(MwError::UnsupportedBasis(_))));
    }
}
