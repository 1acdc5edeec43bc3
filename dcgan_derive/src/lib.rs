//! # Derive Layer and Forward
//! `Layer` can be derived for a struct composed of other layers and parameters.\
//! `Forward` can be derived for sequential networks, calling each `#[dcgan(layer)]` field in order.
//!
//! Field attributes:
//! - `#[dcgan(layer)]`: a child layer.
//! - `#[dcgan(parameter)]`: a `ParameterD`.
//! - `#[dcgan(optional_parameter)]`: an `Option<ParameterD>`.
//!
//! Fields without an attribute are ignored. Inside the `dcgan` crate itself, add `#[dcgan(crate)]`
//! to the struct.
//!```ignore
//! use dcgan::learn::neural_network::layer::{Conv, Forward, Layer, LeakyRelu, Sigmoid};
//!
//! #[derive(Layer, Forward)]
//! struct Critic {
//!     #[dcgan(layer)]
//!     conv: Conv,
//!     #[dcgan(layer)]
//!     leaky_relu: LeakyRelu,
//!     #[dcgan(layer)]
//!     sigmoid: Sigmoid,
//! }
//!```

use proc_macro::TokenStream as BaseTokenStream;
use proc_macro2::TokenStream;
use quote::quote;
use syn::{Attribute, Data, DeriveInput, Error, Index, Member};

#[derive(Clone, Copy, PartialEq, Eq)]
enum FieldKind {
    Layer,
    Parameter,
    OptionalParameter,
}

fn dcgan_args(attributes: &[Attribute]) -> Vec<String> {
    attributes
        .iter()
        .filter(|attribute| attribute.path.is_ident("dcgan"))
        .map(|attribute| attribute.tokens.to_string().replace(' ', ""))
        .collect()
}

fn crate_path(attributes: &[Attribute]) -> TokenStream {
    if dcgan_args(attributes).iter().any(|arg| arg == "(crate)") {
        quote! { crate }
    } else {
        quote! { ::dcgan }
    }
}

fn fields(input: &DeriveInput) -> syn::Result<Vec<(Member, FieldKind)>> {
    let data = match &input.data {
        Data::Struct(data) => data,
        _ => {
            return Err(Error::new_spanned(
                &input.ident,
                "dcgan derives are only implemented for structs",
            ))
        }
    };
    let mut output = Vec::new();
    for (i, field) in data.fields.iter().enumerate() {
        let member = match &field.ident {
            Some(ident) => Member::Named(ident.clone()),
            None => Member::Unnamed(Index::from(i)),
        };
        for arg in dcgan_args(&field.attrs) {
            let kind = match arg.as_str() {
                "(layer)" => FieldKind::Layer,
                "(parameter)" => FieldKind::Parameter,
                "(optional_parameter)" => FieldKind::OptionalParameter,
                _ => {
                    return Err(Error::new_spanned(
                        field,
                        format!("unknown attribute #[dcgan{arg}]"),
                    ))
                }
            };
            output.push((member.clone(), kind));
        }
    }
    Ok(output)
}

fn layer_impl(input: &DeriveInput) -> syn::Result<TokenStream> {
    let krate = crate_path(&input.attrs);
    let ident = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();
    let layer = quote! { #krate::learn::neural_network::layer::Layer };
    let parameter = quote! { #krate::learn::neural_network::autograd::ParameterD };
    let mut len = Vec::new();
    let mut collect = Vec::new();
    let mut collect_mut = Vec::new();
    let mut set_training = Vec::new();
    for (member, kind) in fields(input)? {
        match kind {
            FieldKind::Layer => {
                len.push(quote! { #layer::parameters_len(&self.#member) });
                collect.push(quote! { #layer::collect_parameters(&self.#member, parameters); });
                collect_mut
                    .push(quote! { #layer::collect_parameters_mut(&mut self.#member, parameters); });
                set_training.push(quote! { #layer::set_training(&mut self.#member, training)?; });
            }
            FieldKind::Parameter => {
                len.push(quote! { 1 });
                collect.push(quote! { parameters.push(::std::clone::Clone::clone(&self.#member)); });
                collect_mut.push(quote! { parameters.push(&mut self.#member); });
                set_training.push(quote! { self.#member.set_training(training); });
            }
            FieldKind::OptionalParameter => {
                len.push(quote! { ::std::option::Option::is_some(&self.#member) as usize });
                collect.push(quote! {
                    if let ::std::option::Option::Some(parameter) = &self.#member {
                        parameters.push(::std::clone::Clone::clone(parameter));
                    }
                });
                collect_mut.push(quote! {
                    if let ::std::option::Option::Some(parameter) = &mut self.#member {
                        parameters.push(parameter);
                    }
                });
                set_training.push(quote! {
                    if let ::std::option::Option::Some(parameter) = &mut self.#member {
                        parameter.set_training(training);
                    }
                });
            }
        }
    }
    Ok(quote! {
        impl #impl_generics #layer for #ident #ty_generics #where_clause {
            fn parameters_len(&self) -> usize {
                0 #(+ #len)*
            }
            #[allow(unused_variables)]
            fn collect_parameters(&self, parameters: &mut ::std::vec::Vec<#parameter>) {
                #(#collect)*
            }
            #[allow(unused_variables)]
            fn collect_parameters_mut<'__dcgan>(
                &'__dcgan mut self,
                parameters: &mut ::std::vec::Vec<&'__dcgan mut #parameter>,
            ) {
                #(#collect_mut)*
            }
            #[allow(unused_variables)]
            fn set_training(&mut self, training: bool) -> #krate::result::Result<()> {
                #(#set_training)*
                ::std::result::Result::Ok(())
            }
        }
    })
}

fn forward_impl(input: &DeriveInput) -> syn::Result<TokenStream> {
    let krate = crate_path(&input.attrs);
    let ident = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();
    let forward = quote! { #krate::learn::neural_network::layer::Forward };
    let variable = quote! { #krate::learn::neural_network::autograd::VariableD };
    let layers: Vec<Member> = fields(input)?
        .into_iter()
        .filter(|(_, kind)| *kind == FieldKind::Layer)
        .map(|(member, _)| member)
        .collect();
    Ok(quote! {
        impl #impl_generics #forward for #ident #ty_generics #where_clause {
            fn forward(&self, input: #variable) -> #krate::result::Result<#variable> {
                #(let input = #forward::forward(&self.#layers, input)?;)*
                ::std::result::Result::Ok(input)
            }
        }
    })
}

/// Derives `Layer`.
#[proc_macro_derive(Layer, attributes(dcgan))]
pub fn derive_layer(input: BaseTokenStream) -> BaseTokenStream {
    let input = syn::parse_macro_input!(input as DeriveInput);
    layer_impl(&input)
        .unwrap_or_else(|error| error.to_compile_error())
        .into()
}

/// Derives a sequential `Forward`.
#[proc_macro_derive(Forward, attributes(dcgan))]
pub fn derive_forward(input: BaseTokenStream) -> BaseTokenStream {
    let input = syn::parse_macro_input!(input as DeriveInput);
    forward_impl(&input)
        .unwrap_or_else(|error| error.to_compile_error())
        .into()
}
