// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Declarative macros for wire enums and test builders.
//!
//! - [`wire_display!`] — `Display` impl mirroring an enum's serde wire form
//! - [`test_builder!`] — test-support builder for domain structs

/// Generate a `Display` impl that mirrors an enum's snake_case wire form.
///
/// Step and completion states travel as strings in queue payloads, event
/// records, and SQL columns; keeping `Display` identical to the serde
/// form means one vocabulary everywhere (the relational store parses the
/// same strings back through `FromStr`).
#[macro_export]
macro_rules! wire_display {
    ($enum:ty { $( $variant:ident => $wire:expr ),+ $(,)? }) => {
        impl std::fmt::Display for $enum {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(match self {
                    $( Self::$variant => $wire, )+
                })
            }
        }
    };
}

/// Generate a test builder (struct + Default + setters + `build()`).
///
/// All generated items are gated behind
/// `#[cfg(any(test, feature = "test-support"))]` so other crates' tests
/// can construct domain values without hand-rolling every field.
///
/// Field groups:
/// - `required { field: Type = default_expr }` — carries a concrete test
///   default; the setter takes `impl Into<Type>`
/// - `optional { field: Type }` — builder field is `Option<Type>`
///   defaulting to `None`; the setter wraps in `Some`
///
/// ```ignore
/// planq_core::test_builder! {
///     pub struct FooBuilder => Foo {
///         required {
///             name: String = String::from("test"),
///             count: u32 = 0,
///         }
///         optional {
///             label: String,
///         }
///     }
/// }
/// ```
#[macro_export]
macro_rules! test_builder {
    (
        pub struct $builder:ident => $target:ident {
            required {
                $( $field:ident : $ty:ty = $default:expr ),* $(,)?
            }
            $(optional {
                $( $opt:ident : $opt_ty:ty ),* $(,)?
            })?
        }
    ) => {
        #[cfg(any(test, feature = "test-support"))]
        pub struct $builder {
            $( $field: $ty, )*
            $($( $opt: Option<$opt_ty>, )*)?
        }

        #[cfg(any(test, feature = "test-support"))]
        impl Default for $builder {
            fn default() -> Self {
                Self {
                    $( $field: $default, )*
                    $($( $opt: None, )*)?
                }
            }
        }

        #[cfg(any(test, feature = "test-support"))]
        impl $builder {
            $(
                pub fn $field(mut self, v: impl Into<$ty>) -> Self {
                    self.$field = v.into();
                    self
                }
            )*

            $($(
                pub fn $opt(mut self, v: impl Into<$opt_ty>) -> Self {
                    self.$opt = Some(v.into());
                    self
                }
            )*)?

            pub fn build(self) -> $target {
                $target {
                    $( $field: self.$field, )*
                    $($( $opt: self.$opt, )*)?
                }
            }
        }

        #[cfg(any(test, feature = "test-support"))]
        impl $target {
            /// Create a builder with test defaults.
            pub fn builder() -> $builder {
                $builder::default()
            }
        }
    };
}
