use proc_macro::TokenStream;
use quote::quote;
use syn::{parse_macro_input, Attribute, ItemFn, LitInt};

/// Marks an async test and aborts it if it runs past the deadline.
///
/// `#[tokio_timeout_test]` uses a 60 second deadline; `#[tokio_timeout_test(5)]`
/// overrides it. A wedged await then fails the test instead of hanging the
/// whole suite.
#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let mut timeout_secs: u64 = 60;

    if !attr.is_empty() {
        let lit = parse_macro_input!(attr as LitInt);
        timeout_secs = match lit.base10_parse() {
            Ok(value) => value,
            Err(err) => {
                return syn::Error::new_spanned(&lit, format!("invalid timeout value: {err}"))
                    .to_compile_error()
                    .into();
            }
        };
        if timeout_secs == 0 {
            return syn::Error::new_spanned(&lit, "timeout must be greater than zero")
                .to_compile_error()
                .into();
        }
    }

    let ItemFn {
        attrs,
        vis,
        sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.is_none() {
        return syn::Error::new_spanned(
            &sig.ident,
            "tokio_timeout_test can only be applied to async functions",
        )
        .to_compile_error()
        .into();
    }

    let filtered_attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !is_tokio_test_attribute(attr))
        .collect();

    let timeout = timeout_secs;
    let name = sig.ident.to_string();

    TokenStream::from(quote! {
        #[tokio::test]
        #(#filtered_attrs)*
        #vis #sig {
            let deadline = std::time::Duration::from_secs(#timeout);
            if tokio::time::timeout(deadline, async move #block).await.is_err() {
                panic!("test `{}` timed out after {}s", #name, #timeout);
            }
        }
    })
}

fn is_tokio_test_attribute(attr: &Attribute) -> bool {
    let mut segments = attr.path().segments.iter();
    matches!(
        (segments.next(), segments.next(), segments.next()),
        (Some(first), Some(second), None)
            if first.ident == "tokio" && second.ident == "test"
    )
}
