use crate::remoting::Address;

/// What a crash cost the cluster.
///
/// Produced by the coordinator whenever members leave without handing their
/// segments over. Losing segments here is a measured outcome of concurrent
/// failures, not an error.
#[derive(Debug, Clone, PartialEq)]
pub struct ResiliencyReport {
  /// The topology that stripped the departed members.
  pub topology_id: u32,
  pub leavers: Vec<Address>,
  pub members_before: Vec<Address>,
  /// Segments whose every owner left.
  pub lost_segments: Vec<u32>,
  /// `lost_segments / num_segments`.
  pub estimated_loss_fraction: f64,
}

impl ResiliencyReport {
  pub(crate) fn new(
    topology_id: u32,
    leavers: Vec<Address>,
    members_before: Vec<Address>,
    lost_segments: Vec<u32>,
    num_segments: u32,
  ) -> Self {
    let estimated_loss_fraction = if num_segments == 0 {
      0.0
    } else {
      lost_segments.len() as f64 / num_segments as f64
    };
    Self {
      topology_id,
      leavers,
      members_before,
      lost_segments,
      estimated_loss_fraction,
    }
  }

  #[inline]
  pub fn is_data_lost(&self) -> bool {
    !self.lost_segments.is_empty()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn loss_fraction_is_relative_to_segment_count() {
    let report = ResiliencyReport::new(
      7,
      vec![Address::new("b"), Address::new("c")],
      vec![Address::new("a"), Address::new("b"), Address::new("c")],
      vec![1, 5, 9, 12],
      16,
    );
    assert!(report.is_data_lost());
    assert_eq!(report.estimated_loss_fraction, 0.25);

    let none = ResiliencyReport::new(8, vec![Address::new("b")], vec![], vec![], 16);
    assert!(!none.is_data_lost());
    assert_eq!(none.estimated_loss_fraction, 0.0);
  }
}
