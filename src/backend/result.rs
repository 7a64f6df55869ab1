// Result code mapping
//
// Collapses vk::Result into success / ComputeError and logs the failure once,
// at the point where it leaves the driver. The symbolic code name is always
// logged; the long description only when verbose results are on.

use ash::vk;
use std::sync::atomic::{AtomicBool, Ordering};

use super::error::{ComputeError, ComputeResult};

static VERBOSE_RESULTS: AtomicBool = AtomicBool::new(cfg!(debug_assertions));

/// Toggle logging of the driver's long description next to the code name
pub fn set_verbose(verbose: bool) {
    VERBOSE_RESULTS.store(verbose, Ordering::Relaxed);
}

pub fn is_verbose() -> bool {
    VERBOSE_RESULTS.load(Ordering::Relaxed)
}

/// Symbolic name of a status code, e.g. `ERROR_DEVICE_LOST`
pub fn code_name(code: vk::Result) -> String {
    format!("{:?}", code)
}

/// Human readable description of a status code
pub fn code_description(code: vk::Result) -> String {
    code.to_string()
}

/// Map the `Result<T, vk::Result>` that ash returns from fallible calls.
/// Anything other than SUCCESS is an error.
pub fn checked<T>(result: Result<T, vk::Result>, function: &'static str) -> ComputeResult<T> {
    result.map_err(|code| {
        report(code, function);
        ComputeError::Vk { function, code }
    })
}

fn report(code: vk::Result, function: &str) {
    if is_verbose() {
        log::error!("{}() | {} : {}", function, code_name(code), code_description(code));
    } else {
        log::error!("{}() | {}", function, code_name(code));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_maps_to_ok() {
        assert!(checked(Ok(()), "vkCreateFence").is_ok());
        assert_eq!(checked(Ok(7u32), "vkCreateFence").ok(), Some(7));
    }

    #[test]
    fn non_success_codes_are_errors() {
        // NOT_READY and TIMEOUT are positive codes but still count as failure here
        for code in [
            vk::Result::NOT_READY,
            vk::Result::TIMEOUT,
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY,
            vk::Result::ERROR_DEVICE_LOST,
        ] {
            let err = checked::<()>(Err(code), "vkQueueSubmit").unwrap_err();
            assert_eq!(err.vk_code(), Some(code));
        }
    }

    #[test]
    fn checked_keeps_function_name() {
        let err = checked::<()>(Err(vk::Result::ERROR_INITIALIZATION_FAILED), "vkCreateInstance")
            .unwrap_err();
        match err {
            ComputeError::Vk { function, code } => {
                assert_eq!(function, "vkCreateInstance");
                assert_eq!(code, vk::Result::ERROR_INITIALIZATION_FAILED);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn code_names_are_symbolic() {
        assert_eq!(code_name(vk::Result::ERROR_DEVICE_LOST), "ERROR_DEVICE_LOST");
        assert_eq!(code_name(vk::Result::TIMEOUT), "TIMEOUT");
        assert!(!code_description(vk::Result::ERROR_DEVICE_LOST).is_empty());
    }
}
