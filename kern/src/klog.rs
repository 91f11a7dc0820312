//! Ad hoc trace logging, in the spirit of the reference workspace's own
//! `klog!` macro: a handful of cfg-gated backends behind one call site,
//! none of which allocate or require a working stdio.

cfg_if::cfg_if! {
    if #[cfg(feature = "log-semihosting")] {
        #[macro_export]
        macro_rules! klog {
            ($s:expr) => {{
                cortex_m_semihosting::hprintln!($s);
            }};
            ($s:expr, $($tt:tt)*) => {{
                cortex_m_semihosting::hprintln!($s, $($tt)*);
            }};
        }
    } else if #[cfg(feature = "log-itm")] {
        #[macro_export]
        macro_rules! klog {
            ($s:expr) => {{
                let _ = $s;
            }};
            ($s:expr, $($tt:tt)*) => {{
                let _ = ($s, $($tt)*);
            }};
        }
    } else {
        #[macro_export]
        macro_rules! klog {
            ($s:expr) => {{
                let _ = $s;
            }};
            ($s:expr, $($tt:tt)*) => {{
                let _ = ($s, $($tt)*);
            }};
        }
    }
}
