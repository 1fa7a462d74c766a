//! Maps `Box<dyn Error>` from the output seam to typed `DoserError`.
//!
//! With the `hardware-errors` feature, `microdoser_hardware::error::HwError`
//! is downcast for precise mapping.

use crate::error::DoserError;

/// Map a trait-boundary error to a typed `DoserError`.
pub fn map_hw_error(e: &(dyn std::error::Error + 'static)) -> DoserError {
    #[cfg(feature = "hardware-errors")]
    {
        use microdoser_hardware::error::HwError;
        if let Some(hw) = e.downcast_ref::<HwError>() {
            return match hw {
                HwError::PinUnavailable(_) | HwError::Gpio(_) => {
                    DoserError::HardwareFault(hw.to_string())
                }
                other => DoserError::Hardware(other.to_string()),
            };
        }
    }

    DoserError::Hardware(e.to_string())
}
