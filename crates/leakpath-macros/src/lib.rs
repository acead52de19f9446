use proc_macro::TokenStream;
use quote::quote;
use syn::parse::Parser;
use syn::{parse_macro_input, ItemFn, LitBool, LitInt, LitStr};

#[derive(Clone, Copy)]
enum Format {
    Text,
    Table,
    Json,
    JsonPretty,
}

impl Format {
    fn to_tokens(self) -> proc_macro2::TokenStream {
        match self {
            Format::Text => quote!(leakpath::Format::Text),
            Format::Table => quote!(leakpath::Format::Table),
            Format::Json => quote!(leakpath::Format::Json),
            Format::JsonPretty => quote!(leakpath::Format::JsonPretty),
        }
    }
}

/// Installs the global leak detector for the duration of `main` and writes the final leak
/// report when `main` returns.
///
/// The detector is configured from the `LEAKPATH_*` environment variables first; macro
/// parameters override them. The program must use
/// [`LeakTrackingAllocator`](../leakpath/struct.LeakTrackingAllocator.html) as its global
/// allocator for allocations to be tracked.
///
/// # Parameters
///
/// * `format` - Final report format: `"text"`, `"table"`, `"json"` or `"json-pretty"`.
///   Without it only the detector's own block report is written.
/// * `aggregate` - Collapse duplicate leaks into one entry. Default: `false`
/// * `max_data_dump` - Bytes of each leaked block to hex dump (0 = none)
///
/// # Examples
///
/// ```rust,no_run
/// #[global_allocator]
/// static GLOBAL: leakpath::LeakTrackingAllocator = leakpath::LeakTrackingAllocator;
///
/// #[leakpath::main(format = "table", aggregate = true)]
/// fn main() {
///     std::mem::forget(vec![1u8; 32]);
/// }
/// ```
///
/// # Limitations
///
/// Only one global detector can be installed at a time. Installing a second one (either
/// via this macro or via [`DetectorBuilder`](../leakpath/struct.DetectorBuilder.html))
/// will cause a panic.
#[proc_macro_attribute]
pub fn main(attr: TokenStream, item: TokenStream) -> TokenStream {
    let input = parse_macro_input!(item as ItemFn);
    let attrs = &input.attrs;
    let vis = &input.vis;
    let sig = &input.sig;
    let block = &input.block;

    let mut format: Option<Format> = None;
    let mut aggregate: Option<bool> = None;
    let mut max_data_dump: Option<usize> = None;

    if !attr.is_empty() {
        let parser = syn::meta::parser(|meta| {
            if meta.path.is_ident("format") {
                meta.input.parse::<syn::Token![=]>()?;
                let lit: LitStr = meta.input.parse()?;
                format = Some(match lit.value().as_str() {
                    "text" => Format::Text,
                    "table" => Format::Table,
                    "json" => Format::Json,
                    "json-pretty" => Format::JsonPretty,
                    other => {
                        return Err(meta.error(format!(
                            "Unknown format {:?}. Expected one of: \"text\", \"table\", \"json\", \"json-pretty\"",
                            other
                        )))
                    }
                });
                return Ok(());
            }

            if meta.path.is_ident("aggregate") {
                meta.input.parse::<syn::Token![=]>()?;
                let lit: LitBool = meta.input.parse()?;
                aggregate = Some(lit.value);
                return Ok(());
            }

            if meta.path.is_ident("max_data_dump") {
                meta.input.parse::<syn::Token![=]>()?;
                let li: LitInt = meta.input.parse()?;
                max_data_dump = Some(li.base10_parse()?);
                return Ok(());
            }

            Err(meta.error(
                "Unknown parameter. Supported: format=\"..\", aggregate=bool, max_data_dump=N",
            ))
        });

        if let Err(e) = parser.parse2(proc_macro2::TokenStream::from(attr)) {
            return e.to_compile_error().into();
        }
    }

    let format_call = format.map(|f| {
        let tokens = f.to_tokens();
        quote!(.format(#tokens))
    });
    let aggregate_call = aggregate.map(|a| quote!(.aggregate_duplicates(#a)));
    let dump_call = max_data_dump.map(|n| quote!(.max_data_dump(#n)));

    let guard_init = quote! {
        let _leakpath = leakpath::DetectorBuilder::from_env()
            #format_call
            #aggregate_call
            #dump_call
            .build_global();
    };

    let body = if sig.asyncness.is_some() {
        quote! { #guard_init async { #block }.await }
    } else {
        quote! { #guard_init #block }
    };

    let output = quote! {
        #(#attrs)*
        #vis #sig {
            #body
        }
    };

    output.into()
}

/// Fails a test that leaks memory on its own thread.
///
/// Leaks the thread already had are marked as reported before the body runs. If blocks
/// allocated by the body are still live when it returns, the test panics with their leak
/// report. Requires a global detector installed with
/// [`DetectorBuilder::build_global`](../leakpath/struct.DetectorBuilder.html#method.build_global);
/// without one the body just runs.
///
/// # Examples
///
/// ```rust,no_run
/// #[test]
/// #[leakpath::leak_check]
/// fn parses_without_leaking() {
///     let parsed: Vec<u32> = "1,2,3".split(',').map(|s| s.parse().unwrap()).collect();
///     assert_eq!(parsed.len(), 3);
/// }
/// ```
#[proc_macro_attribute]
pub fn leak_check(attr: TokenStream, item: TokenStream) -> TokenStream {
    if !attr.is_empty() {
        return syn::Error::new(
            proc_macro2::TokenStream::from(attr).into_iter().next().map_or_else(
                proc_macro2::Span::call_site,
                |token| token.span(),
            ),
            "leak_check takes no parameters",
        )
        .to_compile_error()
        .into();
    }

    let input = parse_macro_input!(item as ItemFn);
    let attrs = &input.attrs;
    let vis = &input.vis;
    let sig = &input.sig;
    let block = &input.block;

    if let Some(asyncness) = &sig.asyncness {
        return syn::Error::new_spanned(asyncness, "leak_check does not support async functions")
            .to_compile_error()
            .into();
    }

    let output = quote! {
        #(#attrs)*
        #vis #sig {
            leakpath::check_thread_leaks(move || #block)
        }
    };

    output.into()
}
